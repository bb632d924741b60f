use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::Result;
use crate::tensor::TensorMap;

/// Which half of the two-stage model a binary belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelRole {
    Encoder,
    Decoder,
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encoder => f.write_str("encoder"),
            Self::Decoder => f.write_str("decoder"),
        }
    }
}

/// A loaded model that maps named input tensors to named output tensors.
///
/// The session depends on this abstraction rather than on ONNX Runtime, so
/// tests can drive the whole pipeline with scripted models.
#[async_trait]
pub trait InferenceModel: Send + Sync {
    async fn run(&self, inputs: TensorMap) -> Result<TensorMap>;
}

/// Builds an [`InferenceModel`] from the raw binary fetched for `role`.
pub trait ModelFactory: Send + Sync {
    fn build(&self, role: ModelRole, bytes: &[u8]) -> Result<Arc<dyn InferenceModel>>;
}
