//! Test fixtures and engine helpers.

use crate::recording::RecordingListener;
use orstore_backend::{Backend, MemoryBackend};
use orstore_codec::Value;
use orstore_engine::{
    CollectionEngine, EventKind, PersistConfig, TaskScheduler, VariableEngine,
};
use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Storage key used by the fixtures.
pub const FIXTURE_KEY: &str = "test/items";

/// Installs a `tracing` subscriber that writes to the test output.
///
/// Filtering follows `RUST_LOG` and defaults to `warn`. Safe to call from
/// every test.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A record value `{id}`.
pub fn item(id: &str) -> Value {
    Value::record([("id", Value::from(id))])
}

/// A record value `{id, field: value}`.
pub fn item_with(id: &str, field: &str, value: impl Into<Value>) -> Value {
    Value::record([("id", Value::from(id)), (field, value.into())])
}

/// Polls `check` every few milliseconds until it returns true. Returns
/// false if `timeout` passes first.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let poll = async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(timeout, poll).await.is_ok()
}

/// A collection engine on a fresh [`MemoryBackend`], with a recorder on
/// its change events.
pub struct CollectionFixture {
    /// The backend.
    pub backend: Arc<MemoryBackend>,
    /// The engine under test.
    pub engine: Arc<CollectionEngine>,
    /// Change events of `engine`.
    pub events: RecordingListener,
    /// Scheduler delivering to `events`.
    pub scheduler: Arc<TaskScheduler>,
}

impl CollectionFixture {
    /// Attaches another replica of the same collection.
    pub async fn replica(&self) -> Arc<CollectionEngine> {
        let backend: Arc<dyn Backend> = self.backend.clone();
        let engine = CollectionEngine::attach(FIXTURE_KEY, backend, PersistConfig::default(), false, None)
            .expect("Failed to attach replica");
        engine.wait_ready().await.expect("Replica never became ready");
        engine
    }

    /// Waits until every event scheduled so far has been recorded.
    pub async fn flush(&self) {
        self.scheduler.flush().await;
    }
}

/// Creates a ready [`CollectionFixture`].
pub async fn collection_fixture() -> CollectionFixture {
    init_tracing();
    let backend = Arc::new(MemoryBackend::named("fixture"));
    let shared: Arc<dyn Backend> = backend.clone();
    let engine = CollectionEngine::attach(FIXTURE_KEY, shared, PersistConfig::default(), false, None)
        .expect("Failed to attach collection");
    engine.wait_ready().await.expect("Collection never became ready");

    let events = RecordingListener::new();
    let scheduler = TaskScheduler::spawn();
    engine.on(EventKind::Change, events.callback(), scheduler.clone());

    CollectionFixture {
        backend,
        engine,
        events,
        scheduler,
    }
}

/// Attaches a variable to `key` on `backend`.
pub fn variable_on(backend: &Arc<MemoryBackend>, key: &str) -> Arc<VariableEngine> {
    let shared: Arc<dyn Backend> = backend.clone();
    VariableEngine::attach(key, shared, PersistConfig::default(), false, None)
        .expect("Failed to attach variable")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixture_records_local_changes() {
        let fixture = collection_fixture().await;
        fixture.engine.store(item("x"), ["k1"]).await.unwrap();
        fixture.flush().await;
        assert_eq!(fixture.events.added_ids(), vec!["x".to_string()]);
        assert!(fixture.backend.document(FIXTURE_KEY).is_some());
    }

    #[test]
    fn item_helpers() {
        assert_eq!(item("a").id(), Some("a"));
        assert_eq!(item_with("a", "n", 3).get("n"), Some(&Value::Integer(3)));
    }
}
