use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ndarray::{arr2, Array2, ArrayD};
use tpu_embedding_layers::{
    Activations, ConstantSchedule, EmbeddingCoordinator, EmbeddingError, EmbeddingManager,
    Gradients, IdBatch, RecordingTape, Result, RunMode, TableConfig, TpuEmbeddingLayer,
    TpuEmbeddingLayerParams, ACTIVATION_NORM_METRIC, GRADIENT_MULTIPLIER_METRIC, GRAD_NORM_METRIC,
};

/// Coordinator double: serves fixed activations for the configured features
/// and records everything it is handed.
struct FakeCoprocessor {
    features: Vec<String>,
    enqueued: AtomicUsize,
    applied: Mutex<Vec<Gradients<f32>>>,
}

impl FakeCoprocessor {
    fn new(features: Vec<String>) -> Self {
        Self {
            features,
            enqueued: AtomicUsize::new(0),
            applied: Mutex::new(Vec::new()),
        }
    }
}

impl EmbeddingCoordinator<f32> for FakeCoprocessor {
    fn enqueue(&self, _batch: &IdBatch) -> Result<()> {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn dequeue(&self) -> Result<Activations<f32>> {
        Ok(self
            .features
            .iter()
            .map(|name| (name.clone(), arr2(&[[3.0f32, 4.0]]).into_dyn()))
            .collect())
    }

    fn apply_gradients(&self, gradients: &Gradients<f32>) -> Result<()> {
        self.applied.lock().unwrap().push(gradients.clone());
        Ok(())
    }
}

fn user_table() -> TableConfig<f32> {
    let weights = Array2::from_shape_fn((16, 2), |(i, _)| i as f32);
    TableConfig::new("users", 16, 2)
        .with_input_key("user_id")
        .with_weights(weights.into_dyn())
        .unwrap()
}

fn query_table() -> TableConfig<f32> {
    TableConfig::new("queries", 32, 2)
        .with_input_key("query_tokens")
        .with_max_sequence_length(4)
}

fn training_layer() -> TpuEmbeddingLayer<f32> {
    TpuEmbeddingLayer::new(
        TpuEmbeddingLayerParams::new()
            .with_table(user_table())
            .with_table(query_table())
            .with_batch_size(8)
            .with_learning_rate(0.1)
            .with_lr_schedule(Arc::new(ConstantSchedule::new(1.0)))
            .with_gradient_multiplier_schedule(Arc::new(ConstantSchedule::new(0.5))),
    )
    .unwrap()
}

fn batch() -> IdBatch {
    let mut ids = IdBatch::new();
    ids.insert("user_id".to_string(), arr2(&[[1i64, -1]]).into_dyn());
    ids.insert("query_tokens".to_string(), arr2(&[[0i64, 1, 2, 3]]).into_dyn());
    ids
}

#[test]
fn test_full_training_step_cycle() {
    let _ = env_logger::builder().is_test(true).try_init();

    let layer = training_layer();
    let mut manager = EmbeddingManager::new();
    let built = Arc::new(Mutex::new(None::<Arc<FakeCoprocessor>>));

    let built_clone = built.clone();
    layer
        .create_layer_variables(&mut manager, move |spec| {
            let coordinator = Arc::new(FakeCoprocessor::new(spec.features.keys().cloned().collect()));
            *built_clone.lock().unwrap() = Some(coordinator.clone());
            Ok(coordinator)
        })
        .unwrap();
    let coprocessor = built.lock().unwrap().clone().unwrap();

    assert!(manager.is_enabled());
    assert_eq!(
        manager.feature_names().iter().cloned().collect::<Vec<_>>(),
        ["query_tokens", "user_id"]
    );
    assert!(manager.sequence_features().contains("query_tokens"));
    // One learning-rate summary per table.
    assert_eq!(manager.summary_tensors().len(), 2);

    // One training step: enqueue, dequeue, lookup, apply gradients.
    manager.set_global_step(0);
    manager.enqueue(&batch()).unwrap();
    assert_eq!(coprocessor.enqueued.load(Ordering::Relaxed), 1);

    let mut tape = RecordingTape::new();
    manager.dequeue(&mut tape).unwrap();
    let mut watched = tape.watched().to_vec();
    watched.sort();
    assert_eq!(watched, ["query_tokens", "user_id"]);

    let activations = layer.emb_lookup(&manager, &batch()).unwrap();
    assert_eq!(activations.len(), 2);
    assert_eq!(activations["user_id"], arr2(&[[3.0f32, 4.0]]).into_dyn());

    let mut gradients = Gradients::new();
    gradients.insert("user_id".to_string(), arr2(&[[6.0f32, 8.0]]).into_dyn());
    let metrics = manager.apply_gradients(&gradients).unwrap();

    // Gradients reach the coprocessor scaled by the multiplier schedule.
    let applied = coprocessor.applied.lock().unwrap();
    assert_eq!(applied[0]["user_id"], arr2(&[[3.0f32, 4.0]]).into_dyn());
    drop(applied);

    assert_eq!(metrics[GRADIENT_MULTIPLIER_METRIC], (0.5, 1.0));
    assert!((metrics[GRAD_NORM_METRIC].0 - 5.0).abs() < 1e-6);
    // Two cached activation tensors of [3, 4] each.
    assert!((metrics[ACTIVATION_NORM_METRIC].0 - 50.0f32.sqrt()).abs() < 1e-6);

    // Next step's enqueue invalidates the cache before the new dequeue.
    manager.set_global_step(1);
    manager.enqueue(&batch()).unwrap();
    assert!(layer.emb_lookup(&manager, &batch()).unwrap().is_empty());
}

#[test]
fn test_second_layer_shares_the_coordinator() {
    let layer = training_layer();
    let mut manager = EmbeddingManager::new();
    layer
        .create_layer_variables(&mut manager, |spec| {
            Ok(Arc::new(FakeCoprocessor::new(
                spec.features.keys().cloned().collect(),
            )))
        })
        .unwrap();

    // The manager is enabled, so another layer must not rebuild, and a
    // direct second initialization is a fatal caller mistake.
    layer
        .create_layer_variables(&mut manager, |_| panic!("double build"))
        .unwrap();
    assert_eq!(
        manager.set_coordinator(Arc::new(FakeCoprocessor::new(Vec::new()))),
        Err(EmbeddingError::AlreadyInitialized)
    );
}

#[test]
fn test_disabled_manager_passes_through_empty() {
    let mut manager = EmbeddingManager::<f32>::new();
    let mut tape = RecordingTape::new();

    manager.enqueue(&batch()).unwrap();
    assert!(manager.dequeue(&mut tape).unwrap().is_empty());
    assert!(manager.lookup(None).is_empty());
    assert!(manager
        .apply_gradients(&Gradients::new())
        .unwrap()
        .is_empty());
}

#[test]
fn test_lookup_subset_is_an_intersection() {
    let layer = training_layer();
    let mut manager = EmbeddingManager::new();
    layer
        .create_layer_variables(&mut manager, |spec| {
            Ok(Arc::new(FakeCoprocessor::new(
                spec.features.keys().cloned().collect(),
            )))
        })
        .unwrap();

    let mut tape = RecordingTape::new();
    manager.enqueue(&batch()).unwrap();
    manager.dequeue(&mut tape).unwrap();

    let keys: BTreeSet<String> = ["user_id", "not_a_feature"]
        .iter()
        .map(|k| k.to_string())
        .collect();
    let subset = manager.lookup(Some(&keys));
    assert_eq!(subset.len(), 1);
    assert!(subset.contains_key("user_id"));
}

#[test]
fn test_inference_layer_reads_host_weights() {
    let layer = TpuEmbeddingLayer::new(
        TpuEmbeddingLayerParams::new()
            .with_table(user_table())
            .with_batch_size(8)
            .with_mode(RunMode::Inference)
            .with_learning_rate(0.1)
            .with_lr_schedule(Arc::new(ConstantSchedule::new(1.0)))
            .with_gradient_multiplier_schedule(Arc::new(ConstantSchedule::new(1.0))),
    )
    .unwrap();

    // No coordinator anywhere; this path is pure host-side math.
    let manager = EmbeddingManager::new();
    let mut ids = IdBatch::new();
    ids.insert("user_id".to_string(), arr2(&[[4i64, 6], [2, -1]]).into_dyn());

    let activations = layer.emb_lookup(&manager, &ids).unwrap();
    let values: &ArrayD<f32> = &activations["user_id"];
    assert_eq!(values.shape(), [2, 1, 2]);
    assert_eq!(values[[0, 0, 0]], 5.0); // mean(4, 6)
    assert_eq!(values[[1, 0, 0]], 2.0);
}
