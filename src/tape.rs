//! Gradient observation for dequeued activations.
//!
//! Dequeued activations are produced by the coordinator outside the host
//! autograd graph, so the training-step executor must register them with its
//! tape explicitly before the backward pass. The executor passes its tape to
//! [`EmbeddingManager::dequeue`](crate::manager::EmbeddingManager::dequeue)
//! rather than the manager reaching for an ambient one.

use ndarray::ArrayD;

/// Sink that marks tensors as requiring gradient observation.
pub trait GradientTape<T> {
    fn watch(&mut self, name: &str, values: &ArrayD<T>);
}

/// A tape that records which keys were watched. Useful in tests and in
/// executors that stage gradient wiring separately.
#[derive(Debug, Default)]
pub struct RecordingTape {
    watched: Vec<String>,
}

impl RecordingTape {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys watched so far, in watch order.
    pub fn watched(&self) -> &[String] {
        &self.watched
    }

    pub fn clear(&mut self) {
        self.watched.clear();
    }
}

impl<T> GradientTape<T> for RecordingTape {
    fn watch(&mut self, name: &str, _values: &ArrayD<T>) {
        self.watched.push(name.to_string());
    }
}
