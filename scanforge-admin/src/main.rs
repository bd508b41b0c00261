//! Administrative CLI (spec §6.4, C13 companion): connects directly to the
//! KV store to inspect pool queue depth and the dead-letter queue, without
//! going through the admission HTTP surface.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use scanforge_core::config::ServiceConfig;
use scanforge_core::error::ScanforgeError;
use scanforge_core::kv::{KvStore, RedisKvStore};
use scanforge_core::model::ScannerConfig;
use scanforge_engine::queue::QueueManager;
use serde_json::json;

/// Exit codes per spec §6.4: 0 success, 1 user error, 2 backend error.
const EXIT_SUCCESS: i32 = 0;
const EXIT_USER_ERROR: i32 = 1;
const EXIT_BACKEND_ERROR: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "scanforge-admin", version)]
struct Cli {
    /// Redis/KV connection URL.
    #[arg(long, env = "SCANFORGE_KV_URL")]
    kv_url: Option<String>,

    /// Scanner pool config, used to enumerate known pools for `--all-pools`
    /// and for searching the DLQ across every pool.
    #[arg(long, env = "SCANFORGE_SCANNER_CONFIG")]
    scanner_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Queue/DLQ depth for one pool, or every known pool.
    Stats {
        #[arg(long, conflicts_with = "all_pools")]
        pool: Option<String>,
        #[arg(long)]
        all_pools: bool,
    },
    /// Lists dead-letter entries for one pool, most recently failed first.
    ListDlq {
        #[arg(long)]
        pool: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Shows the full stored record for one dead-lettered task.
    InspectDlq { task_id: String },
    /// Moves a dead-lettered task back onto its pool's queue.
    RetryDlq {
        task_id: String,
        #[arg(long)]
        yes: bool,
    },
    /// Drops every dead-lettered entry across every known pool.
    PurgeDlq {
        #[arg(long)]
        confirm: bool,
    },
}

fn exit_code_for(err: &ScanforgeError) -> i32 {
    match err {
        ScanforgeError::InvalidArgument(_) | ScanforgeError::NotFound(_) | ScanforgeError::Conflict(_) => {
            EXIT_USER_ERROR
        }
        _ => EXIT_BACKEND_ERROR,
    }
}

fn known_pools(scanner_config: &Option<ScannerConfig>) -> Vec<String> {
    let mut pools: Vec<String> =
        scanner_config.as_ref().map(|c| c.pools.keys().cloned().collect()).unwrap_or_default();
    pools.sort();
    pools
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::new("warn")).init();

    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let defaults = ServiceConfig::default();
    let kv_url = cli.kv_url.unwrap_or(defaults.kv_url);
    let scanner_config_path = cli.scanner_config.unwrap_or(defaults.scanner_config_path);

    let scanner_config = std::fs::read_to_string(&scanner_config_path)
        .ok()
        .and_then(|s| serde_yaml::from_str::<ScannerConfig>(&s).ok());

    let kv: Arc<dyn KvStore> = match RedisKvStore::connect(&kv_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("error: failed to connect to redis at {kv_url}: {e}");
            return EXIT_BACKEND_ERROR;
        }
    };
    let queue = QueueManager::new(kv);

    match cli.command {
        Command::Stats { pool, all_pools } => stats(&queue, pool, all_pools, &scanner_config).await,
        Command::ListDlq { pool, limit } => list_dlq(&queue, &pool, limit).await,
        Command::InspectDlq { task_id } => inspect_dlq(&queue, &task_id, &scanner_config).await,
        Command::RetryDlq { task_id, yes } => retry_dlq(&queue, &task_id, yes, &scanner_config).await,
        Command::PurgeDlq { confirm } => purge_dlq(&queue, confirm, &scanner_config).await,
    }
}

async fn stats(queue: &QueueManager, pool: Option<String>, all_pools: bool, scanner_config: &Option<ScannerConfig>) -> i32 {
    let pools = if all_pools {
        let pools = known_pools(scanner_config);
        if pools.is_empty() {
            eprintln!("error: --all-pools requires a readable scanner config to enumerate pools");
            return EXIT_USER_ERROR;
        }
        pools
    } else if let Some(p) = pool {
        vec![p]
    } else {
        eprintln!("error: stats requires --pool P or --all-pools");
        return EXIT_USER_ERROR;
    };

    let mut rows = Vec::new();
    for pool in &pools {
        let depth = match queue.get_depth(pool).await {
            Ok(d) => d,
            Err(e) => {
                eprintln!("error: {e}");
                return exit_code_for(&e);
            }
        };
        let dlq_depth = match queue.get_dlq_size(pool).await {
            Ok(d) => d,
            Err(e) => {
                eprintln!("error: {e}");
                return exit_code_for(&e);
            }
        };
        rows.push(json!({ "pool": pool, "queue_depth": depth, "dlq_depth": dlq_depth }));
    }
    println!("{}", serde_json::to_string_pretty(&json!({ "pools": rows })).unwrap());
    EXIT_SUCCESS
}

async fn list_dlq(queue: &QueueManager, pool: &str, limit: usize) -> i32 {
    match queue.list_dlq(pool, limit).await {
        Ok(entries) => {
            println!("{}", serde_json::to_string_pretty(&entries).unwrap());
            EXIT_SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            exit_code_for(&e)
        }
    }
}

async fn inspect_dlq(queue: &QueueManager, task_id: &str, scanner_config: &Option<ScannerConfig>) -> i32 {
    for pool in known_pools(scanner_config) {
        match queue.list_dlq(&pool, usize::MAX).await {
            Ok(entries) => {
                if let Some(entry) = entries.into_iter().find(|e| e.task_id == task_id) {
                    println!("{}", serde_json::to_string_pretty(&entry).unwrap());
                    return EXIT_SUCCESS;
                }
            }
            Err(e) => {
                eprintln!("error: {e}");
                return exit_code_for(&e);
            }
        }
    }
    eprintln!("error: no dead-letter entry found for task {task_id}");
    EXIT_USER_ERROR
}

async fn retry_dlq(queue: &QueueManager, task_id: &str, yes: bool, scanner_config: &Option<ScannerConfig>) -> i32 {
    if !yes {
        eprint!("retry task {task_id} from its dead-letter queue? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush().ok();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() || !answer.trim().eq_ignore_ascii_case("y") {
            println!("aborted");
            return EXIT_SUCCESS;
        }
    }

    for pool in known_pools(scanner_config) {
        match queue.retry_from_dlq(&pool, task_id).await {
            Ok(true) => {
                println!("requeued task {task_id} onto pool {pool}");
                return EXIT_SUCCESS;
            }
            Ok(false) => continue,
            Err(e) => {
                eprintln!("error: {e}");
                return exit_code_for(&e);
            }
        }
    }
    eprintln!("error: no dead-letter entry found for task {task_id}");
    EXIT_USER_ERROR
}

async fn purge_dlq(queue: &QueueManager, confirm: bool, scanner_config: &Option<ScannerConfig>) -> i32 {
    if !confirm {
        eprintln!("error: purge-dlq requires --confirm");
        return EXIT_USER_ERROR;
    }
    let pools = known_pools(scanner_config);
    if pools.is_empty() {
        eprintln!("error: purge-dlq requires a readable scanner config to enumerate pools");
        return EXIT_USER_ERROR;
    }

    let mut total = 0;
    for pool in &pools {
        match queue.purge_dlq(pool).await {
            Ok(count) => total += count,
            Err(e) => {
                eprintln!("error: {e}");
                return exit_code_for(&e);
            }
        }
    }
    println!("purged {total} dead-letter entries across {} pools", pools.len());
    EXIT_SUCCESS
}
