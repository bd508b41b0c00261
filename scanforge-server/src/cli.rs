use std::path::PathBuf;

use clap::Parser;

/// Scan-orchestration admission server: RPC surface, worker supervisor and
/// housekeeping loop in one process.
#[derive(Debug, Parser)]
#[command(name = "scanforge-server", version)]
pub struct Cli {
    /// Address the HTTP surface (admission RPC, /health, /metrics) binds to.
    #[arg(long, env = "SCANFORGE_BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: String,

    /// YAML file describing scanner pools/instances (spec §6.3).
    #[arg(long, env = "SCANFORGE_SCANNER_CONFIG")]
    pub scanner_config: Option<PathBuf>,

    /// YAML file overriding the validator's authentication plugin-id table
    /// (spec §4.9, §9).
    #[arg(long, env = "SCANFORGE_PLUGIN_TABLE")]
    pub plugin_table: Option<PathBuf>,
}
