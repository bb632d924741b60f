pub mod architecture;
pub mod config;
pub mod errors;
pub mod events;
pub mod geometry;
pub mod model;
pub mod postprocess;
pub mod preprocess;
pub mod prompt;
pub mod segmenter;
pub mod session;
pub mod source;
pub mod tensor;
pub mod traits;

pub mod mocks;

pub use architecture::ArchitectureProfile;
pub use config::{Architecture, Backend, Cli, ModelConfig, PixelScale};
pub use errors::{MapSegError, Result};
pub use events::{EventBus, SegmentationEvent, SubscriptionId};
pub use model::{OrtModel, OrtModelFactory, SessionOptions};
pub use preprocess::{CanvasSurface, ImagePreprocessor, ImageSource, PreprocessedImage};
pub use prompt::{PointLabel, PointPrompt, PromptEncoder};
pub use segmenter::{ResultSource, SegmentOptions, SegmentationResult, Segmenter};
pub use session::{InferenceSession, SessionState};
pub use source::{DefaultModelSource, FileModelSource, HttpModelSource, ModelSource};
pub use tensor::{Tensor, TensorMap};
pub use traits::*;
