//! Scripted model source and models for tests.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::{Backend, ModelConfig};
use crate::errors::{MapSegError, Result};
use crate::source::{ModelSource, ProgressFn};
use crate::tensor::{Tensor, TensorMap};
use crate::traits::{InferenceModel, ModelFactory, ModelRole};

/// Holds fetches until opened. Starts open.
#[derive(Debug, Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    pub fn new(open: bool) -> Self {
        Self {
            tx: Arc::new(watch::channel(open).0),
        }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// In-memory model binaries keyed by URL.
#[derive(Debug, Clone)]
pub struct MockModelSource {
    binaries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    fetches: Arc<AtomicUsize>,
    gate: Gate,
}

impl MockModelSource {
    pub const DECODER_URL: &'static str = "mock://sam/decoder.onnx";
    pub const ENCODER_URL: &'static str = "mock://sam/encoder.onnx";

    pub fn new() -> Self {
        let mut binaries = HashMap::new();
        binaries.insert(Self::DECODER_URL.to_string(), b"decoder".to_vec());
        binaries.insert(Self::ENCODER_URL.to_string(), b"encoder".to_vec());
        Self {
            binaries: Arc::new(Mutex::new(binaries)),
            failing: Arc::new(Mutex::new(HashSet::new())),
            fetches: Arc::new(AtomicUsize::new(0)),
            gate: Gate::new(true),
        }
    }

    /// Configuration pointing at this source's URLs, on the CPU backend.
    pub fn config() -> ModelConfig {
        ModelConfig {
            model_url: Self::DECODER_URL.to_string(),
            encoder_url: Self::ENCODER_URL.to_string(),
            backend: Backend::Cpu,
            ..ModelConfig::default()
        }
    }

    /// Fetches block until [`Gate::open`] is called on [`Self::gate`].
    pub fn gated(mut self) -> Self {
        self.gate = Gate::new(false);
        self
    }

    pub fn gate(&self) -> Gate {
        self.gate.clone()
    }

    /// Answers `url` with HTTP 404 until [`Self::heal`].
    pub fn failing(self, url: &str) -> Self {
        self.failing.lock().insert(url.to_string());
        self
    }

    pub fn heal(&self) {
        self.failing.lock().clear();
    }

    pub fn fetch_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.fetches)
    }
}

impl Default for MockModelSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelSource for MockModelSource {
    async fn fetch(&self, url: &str, on_progress: ProgressFn<'_>) -> Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        on_progress(0.0);
        self.gate.wait().await;

        if self.failing.lock().contains(url) {
            return Err(MapSegError::Fetch {
                url: url.to_string(),
                status: 404,
            });
        }
        let bytes = self.binaries.lock().get(url).cloned().ok_or_else(|| MapSegError::Fetch {
            url: url.to_string(),
            status: 404,
        })?;

        on_progress(0.5);
        on_progress(1.0);
        Ok(bytes)
    }
}

/// What the scripted decoder does when run.
#[derive(Debug, Clone)]
pub enum DecoderBehavior {
    /// A `[1, 1, size, size]` disk of probability 0.95 on zero background,
    /// centered at a normalized position, plus an `iou_predictions` score.
    Disk {
        size: usize,
        center: (f32, f32),
        radius: f32,
    },
    /// Returns these outputs as-is.
    Outputs(TensorMap),
    /// Never resolves.
    Pending,
    /// Fails with a model error carrying this message.
    Fail(String),
}

impl Default for DecoderBehavior {
    fn default() -> Self {
        Self::Disk {
            size: 64,
            center: (0.5, 0.5),
            radius: 0.25,
        }
    }
}

pub fn disk_mask(size: usize, center: (f32, f32), radius: f32) -> Tensor {
    let scale = size as f32;
    ndarray::Array4::from_shape_fn((1, 1, size, size), |(_, _, y, x)| {
        let (dx, dy) = (x as f32 / scale - center.0, y as f32 / scale - center.1);
        if dx.hypot(dy) <= radius {
            0.95f32
        } else {
            0.0
        }
    })
    .into_dyn()
    .into()
}

pub struct MockEncoder {
    embedding_key: String,
    extra_outputs: Vec<String>,
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl InferenceModel for MockEncoder {
    async fn run(&self, _inputs: TensorMap) -> Result<TensorMap> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let mut outputs = TensorMap::new();
        outputs.insert(self.embedding_key.clone(), Tensor::zeros_f32(&[1, 8, 4, 4]));
        for name in &self.extra_outputs {
            outputs.insert(name.clone(), Tensor::zeros_f32(&[1, 4, 8, 8]));
        }
        Ok(outputs)
    }
}

pub struct MockDecoder {
    behavior: DecoderBehavior,
    last_inputs: Arc<Mutex<Option<TensorMap>>>,
}

#[async_trait]
impl InferenceModel for MockDecoder {
    async fn run(&self, inputs: TensorMap) -> Result<TensorMap> {
        *self.last_inputs.lock() = Some(inputs);
        match &self.behavior {
            DecoderBehavior::Disk {
                size,
                center,
                radius,
            } => {
                let mut outputs = TensorMap::new();
                outputs.insert("masks".to_string(), disk_mask(*size, *center, *radius));
                outputs.insert("iou_predictions".to_string(), Tensor::from_f32(&[1, 1], vec![0.9])?);
                Ok(outputs)
            }
            DecoderBehavior::Outputs(outputs) => Ok(outputs.clone()),
            DecoderBehavior::Pending => std::future::pending().await,
            DecoderBehavior::Fail(message) => Err(MapSegError::Model {
                operation: "decoder run".to_string(),
                source: message.clone().into(),
            }),
        }
    }
}

/// Builds [`MockEncoder`] and [`MockDecoder`] regardless of the bytes given.
#[derive(Debug, Clone)]
pub struct MockModelFactory {
    embedding_key: String,
    encoder_extras: Vec<String>,
    decoder: DecoderBehavior,
    fail_on: Option<ModelRole>,
    decoder_inputs: Arc<Mutex<Option<TensorMap>>>,
    encoder_runs: Arc<AtomicUsize>,
}

impl MockModelFactory {
    pub fn new() -> Self {
        Self {
            embedding_key: "image_embeddings".to_string(),
            encoder_extras: Vec::new(),
            decoder: DecoderBehavior::default(),
            fail_on: None,
            decoder_inputs: Arc::new(Mutex::new(None)),
            encoder_runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_embedding_key(mut self, key: &str) -> Self {
        self.embedding_key = key.to_string();
        self
    }

    /// Extra encoder outputs, e.g. high-resolution feature maps.
    pub fn with_encoder_outputs(mut self, names: &[&str]) -> Self {
        self.encoder_extras = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_decoder(mut self, behavior: DecoderBehavior) -> Self {
        self.decoder = behavior;
        self
    }

    pub fn fail_build(mut self, role: ModelRole) -> Self {
        self.fail_on = Some(role);
        self
    }

    /// Inputs of the most recent decoder run.
    pub fn decoder_inputs(&self) -> Arc<Mutex<Option<TensorMap>>> {
        Arc::clone(&self.decoder_inputs)
    }

    pub fn encoder_runs(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.encoder_runs)
    }
}

impl Default for MockModelFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelFactory for MockModelFactory {
    fn build(&self, role: ModelRole, bytes: &[u8]) -> Result<Arc<dyn InferenceModel>> {
        if self.fail_on == Some(role) {
            return Err(MapSegError::Model {
                operation: format!("{role} model load ({} bytes)", bytes.len()),
                source: "corrupt model binary".into(),
            });
        }

        Ok(match role {
            ModelRole::Encoder => Arc::new(MockEncoder {
                embedding_key: self.embedding_key.clone(),
                extra_outputs: self.encoder_extras.clone(),
                runs: Arc::clone(&self.encoder_runs),
            }),
            ModelRole::Decoder => Arc::new(MockDecoder {
                behavior: self.decoder.clone(),
                last_inputs: Arc::clone(&self.decoder_inputs),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_source_reports_progress_and_failures() {
        let source = MockModelSource::new().failing(MockModelSource::ENCODER_URL);
        let seen = Mutex::new(Vec::new());
        let record = |p: f32| seen.lock().push(p);

        let bytes = source.fetch(MockModelSource::DECODER_URL, &record).await;
        assert_eq!(bytes.ok(), Some(b"decoder".to_vec()));
        assert_eq!(*seen.lock(), vec![0.0, 0.5, 1.0]);

        assert!(matches!(
            source.fetch(MockModelSource::ENCODER_URL, &record).await,
            Err(MapSegError::Fetch { status: 404, .. })
        ));
        assert_eq!(source.fetch_counter().load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_disk_mask_is_centered() {
        let mask = disk_mask(10, (0.5, 0.5), 0.2).to_f32_vec();
        assert_eq!(mask[5 * 10 + 5], 0.95);
        assert_eq!(mask[0], 0.0);
    }
}
