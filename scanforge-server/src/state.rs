use std::sync::Arc;

use scanforge_core::config::ServiceConfig;
use scanforge_core::idempotency::IdempotencyCache;
use scanforge_core::kv::KvStore;
use scanforge_core::task_store::TaskStore;
use scanforge_engine::metrics::Metrics;
use scanforge_engine::queue::QueueManager;
use scanforge_engine::registry::Registry;

/// Shared application state handed to every axum handler. Cloning is cheap:
/// every field is either a plain `Arc` or already `Clone`-cheap internally
/// (`TaskStore` wraps a `PathBuf`, `QueueManager` wraps an `Arc<dyn
/// KvStore>`).
#[derive(Clone)]
pub struct AppState {
    pub task_store: TaskStore,
    pub queue: QueueManager,
    pub registry: Arc<Registry>,
    pub idempotency: Arc<IdempotencyCache>,
    pub metrics: Arc<Metrics>,
    pub kv: Arc<dyn KvStore>,
    pub config: Arc<ServiceConfig>,
}
