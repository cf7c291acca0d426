//! Property tests: a collection engine behaves like its model.

use orstore_backend::{Backend, MemoryBackend};
use orstore_crdt::CollectionModel;
use orstore_engine::{CollectionEngine, PersistConfig};
use orstore_testkit::prelude::*;
use proptest::prelude::*;
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build runtime")
}

async fn attached(backend: &Arc<MemoryBackend>) -> Arc<CollectionEngine> {
    let backend: Arc<dyn Backend> = backend.clone();
    let engine = CollectionEngine::attach(FIXTURE_KEY, backend, PersistConfig::default(), false, None)
        .expect("attach collection");
    engine.wait_ready().await.expect("ready");
    engine
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn engine_matches_model(ops in op_sequence_strategy(12)) {
        runtime().block_on(async {
            let backend = Arc::new(MemoryBackend::new());
            let engine = attached(&backend).await;
            let mut model = CollectionModel::new();

            for op in &ops {
                match op {
                    CollectionOp::Add { id, value, keys } => {
                        let expected = model.add(id, value.clone(), keys.iter().cloned());
                        let actual = engine.store(value.clone(), keys.clone()).await;
                        assert_eq!(expected.is_err(), actual.is_err(), "{op:?}");
                    }
                    CollectionOp::Remove { id, keys } => {
                        let removing = if keys.is_empty() { model.keys(id) } else { keys.clone() };
                        model.remove(id, removing.iter());
                        engine.remove(id, keys.clone()).await.expect("remove");
                    }
                }
            }

            assert_eq!(engine.to_list().await.expect("list"), model.to_list());
            assert!(!engine.has_local_changes());

            let replica = attached(&backend).await;
            assert_eq!(replica.to_list().await.expect("list"), model.to_list());
        });
    }

    #[test]
    fn literal_restores_collection(ops in op_sequence_strategy(12)) {
        runtime().block_on(async {
            let engine = attached(&Arc::new(MemoryBackend::new())).await;
            for op in &ops {
                let _ = match op {
                    CollectionOp::Add { value, keys, .. } => engine.store(value.clone(), keys.clone()).await,
                    CollectionOp::Remove { id, keys } => engine.remove(id, keys.clone()).await,
                };
            }

            let copy = attached(&Arc::new(MemoryBackend::new())).await;
            copy.from_literal(engine.to_literal()).await.expect("from literal");
            assert_eq!(copy.to_list().await.expect("list"), engine.to_list().await.expect("list"));
        });
    }
}
