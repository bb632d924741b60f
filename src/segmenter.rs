use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::ModelConfig,
    errors::{MapSegError, Result},
    events::{EventBus, SegmentationEvent, SubscriptionId},
    geometry::{self, Point},
    model::OrtModelFactory,
    postprocess::{self, ConfidenceMetrics, PolygonOptions},
    preprocess::{ImagePreprocessor, ImageSource},
    prompt::{PointLabel, PointPrompt, PromptEncoder},
    session::{InferenceSession, SessionState},
    source::{DefaultModelSource, ModelSource},
    traits::ModelFactory,
};

const SIMULATED_VERTICES: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Model,
    /// Placeholder ring around the click; no model output behind it.
    Simulated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Dimensions {
    pub mask: Size,
    pub processed: Size,
    pub original: Size,
}

/// Wall time per stage, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StageTimings {
    pub preprocess: f64,
    pub inference: f64,
    pub postprocess: f64,
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentationResult {
    /// Binary mask, row-major, `dimensions.mask` sized.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mask: Vec<u8>,
    /// Closed ring in normalized image coordinates.
    pub polygon: Vec<Point>,
    pub confidence: ConfidenceMetrics,
    pub dimensions: Dimensions,
    pub timing: StageTimings,
    /// The normalized click that produced this result.
    pub point: PointPrompt,
    pub source: ResultSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_mask_score: Option<f32>,
}

/// Per-call overrides of the configured defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SegmentOptions {
    pub confidence_threshold: Option<f32>,
    pub simplify_tolerance: Option<f64>,
    pub timeout: Option<Duration>,
    pub label: Option<PointLabel>,
}

impl SegmentOptions {
    fn validate(&self) -> Result<()> {
        if let Some(threshold) = self.confidence_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(MapSegError::Configuration {
                    message: format!("confidence_threshold {threshold} is outside [0, 1]"),
                });
            }
        }
        if let Some(tolerance) = self.simplify_tolerance {
            if !(tolerance >= 0.0) {
                return Err(MapSegError::Configuration {
                    message: format!("simplify_tolerance {tolerance} must be non-negative"),
                });
            }
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(MapSegError::Configuration {
                message: "timeout must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Brings a click into `[0, 1]`.
///
/// In-range coordinates pass through. Anything else is taken as pixels on a
/// canvas of `canvas_size`, since the real view size is not known here.
/// NaN or infinite coordinates are a `Configuration` error.
pub fn normalize_point(point: PointPrompt, canvas_size: [u32; 2]) -> Result<PointPrompt> {
    if !point.x.is_finite() || !point.y.is_finite() {
        return Err(MapSegError::Configuration {
            message: format!("click ({}, {}) is not a finite position", point.x, point.y),
        });
    }
    let unit = 0.0..=1.0;
    if unit.contains(&point.x) && unit.contains(&point.y) {
        return Ok(point);
    }

    let normalized = PointPrompt {
        x: (point.x / f64::from(canvas_size[0])).clamp(0.0, 1.0),
        y: (point.y / f64::from(canvas_size[1])).clamp(0.0, 1.0),
        label: point.label,
    };
    warn!(
        x = point.x,
        y = point.y,
        canvas_width = canvas_size[0],
        canvas_height = canvas_size[1],
        normalized_x = normalized.x,
        normalized_y = normalized.y,
        "click outside [0, 1], treating it as pixels on the default canvas"
    );
    Ok(normalized)
}

/// Deterministic placeholder ring around `point`, closed.
pub fn simulated_polygon(point: PointPrompt, radius: f64) -> Vec<Point> {
    let ring = (0..SIMULATED_VERTICES)
        .map(|i| {
            let angle = TAU * i as f64 / SIMULATED_VERTICES as f64;
            let r = radius * (1.0 + 0.2 * (3.0 * angle).sin());
            [
                (point.x + r * angle.cos()).clamp(0.0, 1.0),
                (point.y + r * angle.sin()).clamp(0.0, 1.0),
            ]
        })
        .collect();
    geometry::close(ring)
}

/// Click-to-polygon front door: owns the session, the preprocessor and the
/// subscriber list.
pub struct Segmenter {
    config: ModelConfig,
    session: InferenceSession,
    preprocessor: ImagePreprocessor,
    events: EventBus,
}

impl Segmenter {
    /// ONNX Runtime models fetched over HTTP or from local paths.
    pub fn new(config: ModelConfig) -> Result<Self> {
        let factory = OrtModelFactory::from_config(&config);
        Self::with_components(config, Arc::new(DefaultModelSource::default()), Arc::new(factory))
    }

    pub fn with_components(
        config: ModelConfig,
        source: Arc<dyn ModelSource>,
        factory: Arc<dyn ModelFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new();
        let preprocessor = ImagePreprocessor::new(config.pixel_scale());
        let session = InferenceSession::new(config.clone(), source, factory, events.clone());
        Ok(Self {
            config,
            session,
            preprocessor,
            events,
        })
    }

    pub fn with_preprocessor(mut self, preprocessor: ImagePreprocessor) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn session(&self) -> &InferenceSession {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&SegmentationEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Loads the models ahead of the first click.
    pub async fn initialize(&self) -> Result<()> {
        self.session
            .initialize()
            .await
            .inspect_err(|e| self.events.error(e))
    }

    /// Segments the object under `point` and traces its outline.
    ///
    /// Every failure is published as an error event. With
    /// `fallback_to_simulation` set, eligible failures then resolve to a
    /// [`ResultSource::Simulated`] placeholder instead of an error.
    #[instrument(skip(self, image, options), fields(x = point.x, y = point.y))]
    pub async fn segment(
        &self,
        image: impl Into<ImageSource>,
        point: PointPrompt,
        options: SegmentOptions,
    ) -> Result<SegmentationResult> {
        options.validate()?;

        let mut point = normalize_point(point, self.config.default_canvas_size)?;
        if let Some(label) = options.label {
            point.label = Some(label);
        }

        match self.segment_with_model(image.into(), point, &options).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.events.error(&e);
                if self.config.fallback_to_simulation
                    && e.allows_simulation(self.config.fallback_on_invalid_mask)
                {
                    warn!(error = %e, "segmentation failed, returning simulated polygon");
                    Ok(self.simulated(point))
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn segment_with_model(
        &self,
        image: ImageSource,
        point: PointPrompt,
        options: &SegmentOptions,
    ) -> Result<SegmentationResult> {
        if !self.session.is_loaded() {
            self.session.initialize().await?;
        }

        let started = Instant::now();
        let image = self.preprocessor.preprocess(image, self.config.max_size).await?;
        let processed = Size::new(image.width, image.height);
        let original = Size::new(image.original_width, image.original_height);
        let prompt = PromptEncoder::encode(&[point], image.width, image.height)?;
        let preprocess = started.elapsed();
        debug!(elapsed_ms = millis(preprocess), "preprocess done");

        let timeout = options.timeout.unwrap_or_else(|| self.config.timeout());
        let inference_started = Instant::now();
        let outputs = tokio::time::timeout(timeout, self.session.run(image, prompt))
            .await
            .map_err(|_| MapSegError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })??;
        let inference = inference_started.elapsed();
        debug!(elapsed_ms = millis(inference), "inference done");

        let postprocess_started = Instant::now();
        let profile = self.session.profile();
        let plane = postprocess::extract_mask(&outputs, &profile.mask_keys, &profile.score_keys)?;

        let mut polygon_options = PolygonOptions::from_config(&self.config);
        if let Some(threshold) = options.confidence_threshold {
            polygon_options.threshold = threshold;
        }
        if let Some(tolerance) = options.simplify_tolerance {
            polygon_options.simplify_tolerance = tolerance;
        }

        let polygon = postprocess::to_polygon(&plane.data, plane.width, plane.height, &polygon_options)?;
        let confidence = postprocess::confidence_metrics(&plane.data);
        let mask = postprocess::binarize(&plane.data, polygon_options.threshold);
        let postprocess = postprocess_started.elapsed();

        info!(
            vertices = polygon.len(),
            area = confidence.area,
            score = ?plane.score,
            total_ms = millis(started.elapsed()),
            "segmentation complete"
        );

        Ok(SegmentationResult {
            mask,
            polygon,
            confidence,
            dimensions: Dimensions {
                mask: Size::new(plane.width as u32, plane.height as u32),
                processed,
                original,
            },
            timing: StageTimings {
                preprocess: millis(preprocess),
                inference: millis(inference),
                postprocess: millis(postprocess),
            },
            point,
            source: ResultSource::Model,
            best_mask_score: plane.score,
        })
    }

    fn simulated(&self, point: PointPrompt) -> SegmentationResult {
        SegmentationResult {
            mask: Vec::new(),
            polygon: simulated_polygon(point, self.config.simulation_radius),
            confidence: ConfidenceMetrics::default(),
            dimensions: Dimensions::default(),
            timing: StageTimings::default(),
            point,
            source: ResultSource::Simulated,
            best_mask_score: None,
        }
    }
}

impl std::fmt::Debug for Segmenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segmenter")
            .field("session", &self.session)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}
