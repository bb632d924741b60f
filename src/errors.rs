use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for the segmentation core.
///
/// Variants are grouped by the stage that raises them: model acquisition,
/// preprocessing, prompt encoding, session lifecycle, postprocessing and
/// orchestration. Each one carries the context a caller needs to tell the
/// failures apart without parsing strings.
#[derive(Error, Debug)]
pub enum MapSegError {
    #[error("Fetch error: {url} answered with HTTP {status}")]
    Fetch { url: String, status: u16 },

    #[error("Network error while reading {url}")]
    Network {
        url: String,
        #[source]
        source: BoxError,
    },

    #[error("Decode error: {url} declared {expected} bytes but {actual} arrived")]
    Decode {
        url: String,
        expected: u64,
        actual: u64,
    },

    #[error("Unsupported image source: {reason}")]
    UnsupportedImageSource { reason: String },

    #[error("Image load error: {location}")]
    ImageLoad {
        location: String,
        #[source]
        source: BoxError,
    },

    #[error("Prompt must contain at least one point")]
    EmptyPrompt,

    #[error("Inference session is already loading")]
    AlreadyLoading,

    #[error("Inference session is not initialized")]
    NotInitialized,

    #[error("Image embedding not found in encoder outputs (tried {tried:?}, available {available:?})")]
    EmbeddingNotFound {
        tried: Vec<String>,
        available: Vec<String>,
    },

    #[error("A segmentation run is already in flight on this session")]
    SegmentationInProgress,

    #[error("Invalid mask: {reason}")]
    InvalidMask { reason: String },

    #[error("Segmentation timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: BoxError,
    },
}

pub type Result<T> = std::result::Result<T, MapSegError>;

impl MapSegError {
    pub(crate) fn invalid_mask(reason: impl Into<String>) -> Self {
        Self::InvalidMask {
            reason: reason.into(),
        }
    }

    /// Whether the orchestrator may swap this failure for a simulated polygon.
    ///
    /// Overlapping runs are a caller bug and always surface. A malformed mask
    /// after a successful inference points at an architecture mismatch, so it
    /// only falls back when explicitly allowed.
    pub fn allows_simulation(&self, fallback_on_invalid_mask: bool) -> bool {
        match self {
            Self::SegmentationInProgress => false,
            Self::InvalidMask { .. } => fallback_on_invalid_mask,
            _ => true,
        }
    }
}

/// Convert ONNX Runtime errors to model errors.
impl From<ort::Error> for MapSegError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert ndarray shape errors to model errors.
///
/// Shape errors come from building or reshaping tensors at the model boundary,
/// so they share the model category instead of getting their own.
impl From<ndarray::ShapeError> for MapSegError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert image crate errors to image load errors.
impl From<image::ImageError> for MapSegError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageLoad {
            location: "unknown".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert I/O errors without a known origin to network errors.
///
/// Callers that know the URL or path construct `MapSegError::Network`
/// directly; this is the fallback for bare `?` on I/O.
impl From<std::io::Error> for MapSegError {
    fn from(err: std::io::Error) -> Self {
        Self::Network {
            url: "unknown".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<toml::de::Error> for MapSegError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulation_eligibility() {
        assert!(MapSegError::Timeout { timeout_ms: 10 }.allows_simulation(false));
        assert!(MapSegError::NotInitialized.allows_simulation(false));
        assert!(!MapSegError::SegmentationInProgress.allows_simulation(true));

        let invalid = MapSegError::invalid_mask("no data");
        assert!(!invalid.allows_simulation(false));
        assert!(invalid.allows_simulation(true));
    }

    #[test]
    fn test_display_carries_context() {
        let err = MapSegError::Decode {
            url: "https://example.com/encoder.onnx".to_string(),
            expected: 10,
            actual: 7,
        };
        let message = err.to_string();
        assert!(message.contains("declared 10 bytes"));
        assert!(message.contains("7 arrived"));
    }
}
