use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{DynamicImage, RgbaImage};
use parking_lot::Mutex;

use mapseg_rs::mocks::{DecoderBehavior, MockModelFactory, MockModelSource};
use mapseg_rs::{
    MapSegError, ModelConfig, PointPrompt, ResultSource, SegmentOptions, SegmentationEvent,
    Segmenter, Tensor, TensorMap,
};

fn config(fallback: bool) -> ModelConfig {
    ModelConfig {
        max_size: 32,
        timeout_ms: 100,
        fallback_to_simulation: fallback,
        ..MockModelSource::config()
    }
}

fn segmenter(config: ModelConfig, decoder: DecoderBehavior) -> Segmenter {
    Segmenter::with_components(
        config,
        Arc::new(MockModelSource::new()),
        Arc::new(MockModelFactory::new().with_decoder(decoder)),
    )
    .unwrap()
}

fn view() -> DynamicImage {
    DynamicImage::ImageRgba8(RgbaImage::new(20, 20))
}

fn error_events(segmenter: &Segmenter) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    segmenter.subscribe(move |event| {
        if let SegmentationEvent::Error(message) = event {
            sink.lock().push(message.clone());
        }
        Ok(())
    });
    seen
}

/// Decoder outputs without any recognizable mask.
fn maskless_outputs() -> DecoderBehavior {
    let mut outputs = TensorMap::new();
    outputs.insert("unexpected".to_string(), Tensor::zeros_f32(&[1, 1, 4, 4]));
    DecoderBehavior::Outputs(outputs)
}

#[tokio::test]
async fn test_never_resolving_run_times_out() {
    let segmenter = segmenter(config(false), DecoderBehavior::Pending);
    segmenter.initialize().await.unwrap();
    let errors = error_events(&segmenter);

    let started = Instant::now();
    let result = segmenter
        .segment(view(), PointPrompt::new(0.5, 0.5), SegmentOptions::default())
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(MapSegError::Timeout { timeout_ms: 100 })));
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
    assert_eq!(errors.lock().len(), 1);
}

#[tokio::test]
async fn test_timeout_falls_back_to_simulated_polygon() {
    let segmenter = segmenter(config(true), DecoderBehavior::Pending);
    let errors = error_events(&segmenter);

    let result = segmenter
        .segment(view(), PointPrompt::new(0.3, 0.7), SegmentOptions::default())
        .await
        .unwrap();

    assert_eq!(result.source, ResultSource::Simulated);
    assert_eq!(result.polygon.len(), 13);
    assert_eq!(result.polygon.first(), result.polygon.last());
    assert_eq!((result.point.x, result.point.y), (0.3, 0.7));
    assert!(result.mask.is_empty());
    assert_eq!(errors.lock().len(), 1);
}

#[tokio::test]
async fn test_per_call_timeout_overrides_config() {
    let config = ModelConfig {
        timeout_ms: 60_000,
        ..config(false)
    };
    let segmenter = segmenter(config, DecoderBehavior::Pending);
    let options = SegmentOptions {
        timeout: Some(Duration::from_millis(50)),
        ..SegmentOptions::default()
    };

    let result = segmenter
        .segment(view(), PointPrompt::new(0.5, 0.5), options)
        .await;
    assert!(matches!(result, Err(MapSegError::Timeout { timeout_ms: 50 })));
}

#[tokio::test]
async fn test_session_is_usable_after_timeout() {
    let segmenter = segmenter(config(false), DecoderBehavior::Pending);

    for _ in 0..2 {
        let result = segmenter
            .segment(view(), PointPrompt::new(0.5, 0.5), SegmentOptions::default())
            .await;
        // A leaked in-flight slot would turn the second call into SegmentationInProgress.
        assert!(matches!(result, Err(MapSegError::Timeout { .. })));
    }
}

#[tokio::test]
async fn test_model_failure_fallback_matrix() {
    let failing = || DecoderBehavior::Fail("execution provider crashed".to_string());

    let result = segmenter(config(false), failing())
        .segment(view(), PointPrompt::new(0.5, 0.5), SegmentOptions::default())
        .await;
    assert!(matches!(result, Err(MapSegError::Model { .. })));

    let result = segmenter(config(true), failing())
        .segment(view(), PointPrompt::new(0.5, 0.5), SegmentOptions::default())
        .await
        .unwrap();
    assert_eq!(result.source, ResultSource::Simulated);
}

#[tokio::test]
async fn test_invalid_mask_falls_back_only_when_allowed() {
    let result = segmenter(config(true), maskless_outputs())
        .segment(view(), PointPrompt::new(0.5, 0.5), SegmentOptions::default())
        .await;
    assert!(matches!(result, Err(MapSegError::InvalidMask { .. })));

    let permissive = ModelConfig {
        fallback_on_invalid_mask: true,
        ..config(true)
    };
    let result = segmenter(permissive, maskless_outputs())
        .segment(view(), PointPrompt::new(0.5, 0.5), SegmentOptions::default())
        .await
        .unwrap();
    assert_eq!(result.source, ResultSource::Simulated);
}

#[tokio::test]
async fn test_missing_embedding_falls_back() {
    let segmenter = Segmenter::with_components(
        config(true),
        Arc::new(MockModelSource::new()),
        Arc::new(MockModelFactory::new().with_embedding_key("vision_features")),
    )
    .unwrap();
    let errors = error_events(&segmenter);

    let result = segmenter
        .segment(view(), PointPrompt::new(0.5, 0.5), SegmentOptions::default())
        .await
        .unwrap();
    assert_eq!(result.source, ResultSource::Simulated);
    assert!(errors.lock()[0].contains("vision_features"));
}

#[tokio::test]
async fn test_overlapping_segment_is_rejected_even_with_fallback() {
    let segmenter = segmenter(config(true), DecoderBehavior::Pending);
    segmenter.initialize().await.unwrap();

    let first = segmenter.segment(view(), PointPrompt::new(0.5, 0.5), SegmentOptions::default());
    let second = async {
        tokio::task::yield_now().await;
        segmenter
            .segment(view(), PointPrompt::new(0.5, 0.5), SegmentOptions::default())
            .await
    };
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.unwrap().source, ResultSource::Simulated);
    assert!(matches!(second, Err(MapSegError::SegmentationInProgress)));
}

#[tokio::test]
async fn test_failing_subscriber_does_not_break_segmentation() {
    let segmenter = segmenter(config(false), DecoderBehavior::default());
    segmenter.subscribe(|_| anyhow::bail!("display went away"));
    let delivered = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&delivered);
    let id = segmenter.subscribe(move |_| {
        *counter.lock() += 1;
        Ok(())
    });

    let result = segmenter
        .segment(view(), PointPrompt::new(0.5, 0.5), SegmentOptions::default())
        .await
        .unwrap();
    assert_eq!(result.source, ResultSource::Model);
    assert!(*delivered.lock() > 0);

    assert!(segmenter.unsubscribe(id));
    assert_eq!(segmenter.events().subscriber_count(), 1);
}

#[tokio::test]
async fn test_non_finite_click_is_rejected_even_with_fallback() {
    let segmenter = segmenter(config(true), DecoderBehavior::default());
    let errors = error_events(&segmenter);

    let result = segmenter
        .segment(view(), PointPrompt::new(f64::NAN, 0.5), SegmentOptions::default())
        .await;
    assert!(matches!(result, Err(MapSegError::Configuration { .. })));
    assert!(errors.lock().is_empty());
}
