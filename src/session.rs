use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::{
    architecture::ArchitectureProfile,
    config::ModelConfig,
    errors::{MapSegError, Result},
    events::EventBus,
    preprocess::PreprocessedImage,
    prompt::EncodedPrompt,
    source::ModelSource,
    tensor::{resolve_field, TensorMap},
    traits::{InferenceModel, ModelFactory, ModelRole},
};

/// Lifecycle of the model pair.
///
/// `Unloaded -> Loading -> Loaded | Error`. Leaving `Error` takes another
/// [`InferenceSession::initialize`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unloaded,
    Loading,
    Loaded,
    Error,
}

// Share of the overall load progress per phase.
const HEAD_PERCENT: f32 = 5.0;
const DECODER_SHARE: f32 = 70.0;
const ENCODER_SHARE: f32 = 20.0;

struct LoadedModels {
    encoder: Arc<dyn InferenceModel>,
    decoder: Arc<dyn InferenceModel>,
}

struct Inner {
    state: SessionState,
    models: Option<LoadedModels>,
}

/// Resets an abandoned load so a later call can retry.
struct LoadingGuard<'a> {
    inner: &'a Mutex<Inner>,
    events: &'a EventBus,
    armed: bool,
}

impl LoadingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("model load was cancelled");
            self.inner.lock().state = SessionState::Error;
            self.events.state_changed(SessionState::Error);
        }
    }
}

/// Marks a run as in flight for as long as it is alive.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| MapSegError::SegmentationInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the encoder and decoder and runs them for one prompt at a time.
pub struct InferenceSession {
    config: ModelConfig,
    profile: ArchitectureProfile,
    source: Arc<dyn ModelSource>,
    factory: Arc<dyn ModelFactory>,
    events: EventBus,
    inner: Mutex<Inner>,
    in_flight: AtomicBool,
}

impl InferenceSession {
    pub fn new(
        config: ModelConfig,
        source: Arc<dyn ModelSource>,
        factory: Arc<dyn ModelFactory>,
        events: EventBus,
    ) -> Self {
        let profile = config.profile();
        Self {
            config,
            profile,
            source,
            factory,
            events,
            inner: Mutex::new(Inner {
                state: SessionState::Unloaded,
                models: None,
            }),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == SessionState::Loaded
    }

    pub fn profile(&self) -> &ArchitectureProfile {
        &self.profile
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Fetches both binaries concurrently and builds the models.
    ///
    /// Does nothing once loaded. A second call while a load is running
    /// fails with [`MapSegError::AlreadyLoading`].
    #[instrument(skip(self), fields(architecture = ?self.profile.architecture))]
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                SessionState::Loaded => {
                    debug!("models already loaded");
                    return Ok(());
                }
                SessionState::Loading => return Err(MapSegError::AlreadyLoading),
                SessionState::Unloaded | SessionState::Error => {
                    inner.state = SessionState::Loading;
                    inner.models = None;
                }
            }
        }
        self.events.state_changed(SessionState::Loading);

        let guard = LoadingGuard {
            inner: &self.inner,
            events: &self.events,
            armed: true,
        };
        let started = Instant::now();
        let loaded = self.load_models().await;
        guard.disarm();

        match loaded {
            Ok(models) => {
                {
                    let mut inner = self.inner.lock();
                    inner.models = Some(models);
                    inner.state = SessionState::Loaded;
                }
                self.events.state_changed(SessionState::Loaded);
                self.events.progress(100.0, "Models loaded successfully");
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "models loaded");
                Ok(())
            }
            Err(e) => {
                self.inner.lock().state = SessionState::Error;
                self.events.state_changed(SessionState::Error);
                warn!(error = %e, "model load failed");
                Err(e)
            }
        }
    }

    async fn load_models(&self) -> Result<LoadedModels> {
        self.events.progress(HEAD_PERCENT, "Downloading models...");

        // Each fetch owns one slot; the sum only grows, so overall progress
        // stays monotonic however the two downloads interleave.
        let fractions = Mutex::new([0.0f32; 2]);
        let report = |slot: usize, fraction: f32, message: &str| {
            let percent = {
                let mut fractions = fractions.lock();
                fractions[slot] = fractions[slot].max(fraction);
                HEAD_PERCENT + DECODER_SHARE * fractions[0] + ENCODER_SHARE * fractions[1]
            };
            self.events.progress(percent, message);
        };
        let on_decoder = |fraction: f32| report(0, fraction, "Downloading decoder model...");
        let on_encoder = |fraction: f32| report(1, fraction, "Downloading encoder model...");

        let (decoder_bytes, encoder_bytes) = tokio::try_join!(
            self.source.fetch(&self.config.model_url, &on_decoder),
            self.source.fetch(&self.config.encoder_url, &on_encoder),
        )?;
        debug!(
            decoder_bytes = decoder_bytes.len(),
            encoder_bytes = encoder_bytes.len(),
            "model binaries fetched"
        );

        self.events.progress(
            HEAD_PERCENT + DECODER_SHARE + ENCODER_SHARE,
            "Initializing inference sessions...",
        );

        let factory = Arc::clone(&self.factory);
        let (encoder, decoder) = tokio::task::spawn_blocking(move || -> Result<_> {
            let encoder = factory.build(ModelRole::Encoder, &encoder_bytes)?;
            let decoder = factory.build(ModelRole::Decoder, &decoder_bytes)?;
            Ok((encoder, decoder))
        })
        .await
        .map_err(|e| MapSegError::Model {
            operation: "model construction task".to_string(),
            source: Box::new(e),
        })??;

        Ok(LoadedModels { encoder, decoder })
    }

    /// Drops the models and returns to `Unloaded`.
    pub fn unload(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Loading {
            return Err(MapSegError::AlreadyLoading);
        }
        inner.models = None;
        inner.state = SessionState::Unloaded;
        drop(inner);
        self.events.state_changed(SessionState::Unloaded);
        Ok(())
    }

    /// Encodes the image, then decodes masks for the prompt.
    ///
    /// Returns the raw decoder outputs. Only one run may be in flight; the
    /// slot frees when the returned future completes or is dropped.
    pub async fn run(&self, image: PreprocessedImage, prompt: EncodedPrompt) -> Result<TensorMap> {
        let (encoder, decoder) = {
            let inner = self.inner.lock();
            match (inner.state, &inner.models) {
                (SessionState::Loaded, Some(models)) => {
                    (Arc::clone(&models.encoder), Arc::clone(&models.decoder))
                }
                _ => return Err(MapSegError::NotInitialized),
            }
        };
        let _guard = RunGuard::acquire(&self.in_flight)?;

        let PreprocessedImage {
            tensor,
            width,
            height,
            ..
        } = image;

        let mut encoder_inputs = TensorMap::new();
        encoder_inputs.insert(self.profile.encoder_input.clone(), tensor);
        let mut encoder_outputs = encoder.run(encoder_inputs).await?;

        let embedding_name = resolve_field(&encoder_outputs, &self.profile.embedding_keys)
            .map(|(name, _)| name.to_string());
        let embedding = embedding_name
            .and_then(|name| encoder_outputs.remove(&name))
            .ok_or_else(|| MapSegError::EmbeddingNotFound {
            tried: self.profile.embedding_keys.clone(),
            available: encoder_outputs.keys().cloned().collect(),
        })?;

        let mut decoder_inputs = TensorMap::new();
        decoder_inputs.insert("image_embeddings".to_string(), embedding);
        decoder_inputs.insert("point_coords".to_string(), prompt.coords.with_batch_axis());
        decoder_inputs.insert("point_labels".to_string(), prompt.labels.with_batch_axis());
        for (name, tensor) in self
            .profile
            .decoder_extras(&mut encoder_outputs, height, width)?
        {
            decoder_inputs.insert(name, tensor);
        }

        debug!(inputs = ?decoder_inputs.keys().collect::<Vec<_>>(), "running decoder");
        decoder.run(decoder_inputs).await
    }
}

impl std::fmt::Debug for InferenceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceSession")
            .field("state", &self.state())
            .field("architecture", &self.profile.architecture)
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}
