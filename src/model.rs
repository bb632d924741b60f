use std::sync::Arc;

use async_trait::async_trait;
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
        TensorRTExecutionProvider,
    },
    session::{builder::SessionBuilder, Session},
    value::{DynValue, Tensor as OrtTensor},
};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    config::{Backend, ModelConfig},
    errors::{MapSegError, Result},
    tensor::{Tensor, TensorMap},
    traits::{InferenceModel, ModelFactory, ModelRole},
};

fn model_error(operation: impl Into<String>) -> impl FnOnce(ort::Error) -> MapSegError {
    let operation = operation.into();
    move |e| MapSegError::Model {
        operation,
        source: Box::new(e),
    }
}

/// ONNX Runtime session for one half of the model pair.
pub struct OrtModel {
    role: ModelRole,
    output_names: Vec<String>,
    session: Arc<Mutex<Session>>,
}

impl OrtModel {
    pub fn from_memory(role: ModelRole, bytes: &[u8], options: &SessionOptions) -> Result<Self> {
        let mut builder = SessionBuilder::new()
            .map_err(model_error("session builder initialization"))?
            .with_execution_providers(options.execution_providers())
            .map_err(model_error("execution provider setup"))?
            .with_memory_pattern(true)
            .map_err(model_error("memory pattern setup"))?;

        if let Some(threads) = options.intra_threads {
            builder = builder
                .with_intra_threads(threads)
                .map_err(model_error("intra-op thread setup"))?;
        }

        let session = builder
            .commit_from_memory(bytes)
            .map_err(model_error(format!("{role} model load ({} bytes)", bytes.len())))?;

        let output_names = session.outputs.iter().map(|o| o.name.clone()).collect();
        info!(
            %role,
            inputs = ?session.inputs.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
            outputs = ?output_names,
            "ONNX session ready"
        );

        Ok(Self {
            role,
            output_names,
            session: Arc::new(Mutex::new(session)),
        })
    }
}

fn to_ort_value(tensor: Tensor) -> Result<DynValue> {
    Ok(match tensor {
        Tensor::Float32(array) => OrtTensor::from_array(array)?.into_dyn(),
        Tensor::Int64(array) => OrtTensor::from_array(array)?.into_dyn(),
    })
}

fn from_ort_value(name: &str, value: &DynValue) -> Result<Tensor> {
    if let Ok(array) = value.try_extract_array::<f32>() {
        return Ok(Tensor::Float32(array.to_owned()));
    }
    if let Ok(array) = value.try_extract_array::<i64>() {
        return Ok(Tensor::Int64(array.to_owned()));
    }
    Err(MapSegError::Model {
        operation: format!("output extraction for `{name}`"),
        source: Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "output is neither a float32 nor an int64 tensor",
        )),
    })
}

fn run_blocking(session: &Mutex<Session>, output_names: &[String], inputs: TensorMap) -> Result<TensorMap> {
    let values = inputs
        .into_iter()
        .map(|(name, tensor)| Ok((name, to_ort_value(tensor)?)))
        .collect::<Result<Vec<(String, DynValue)>>>()?;

    let mut session = session.lock();
    let outputs = session.run(values)?;

    let mut result = TensorMap::new();
    for name in output_names {
        result.insert(name.clone(), from_ort_value(name, &outputs[name.as_str()])?);
    }
    Ok(result)
}

#[async_trait]
impl InferenceModel for OrtModel {
    async fn run(&self, inputs: TensorMap) -> Result<TensorMap> {
        debug!(role = %self.role, inputs = ?inputs.keys().collect::<Vec<_>>(), "running model");
        let session = Arc::clone(&self.session);
        let output_names = self.output_names.clone();
        let role = self.role;

        // The ONNX call blocks; keep it off the async scheduler so a timeout
        // can still fire while it runs.
        tokio::task::spawn_blocking(move || run_blocking(&session, &output_names, inputs))
            .await
            .map_err(|e| MapSegError::Model {
                operation: format!("{role} inference task"),
                source: Box::new(e),
            })?
    }
}

/// Session construction knobs taken from [`ModelConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub backend: Backend,
    pub device_id: i32,
    pub intra_threads: Option<usize>,
}

impl SessionOptions {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            backend: config.backend,
            device_id: config.device_id,
            intra_threads: config.intra_threads,
        }
    }

    fn execution_providers(&self) -> Vec<ExecutionProviderDispatch> {
        match self.backend {
            Backend::Accelerated => vec![
                TensorRTExecutionProvider::default()
                    .with_device_id(self.device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(self.device_id)
                    .build(),
                CPUExecutionProvider::default().build(),
            ],
            Backend::Cpu => vec![CPUExecutionProvider::default().build()],
        }
    }
}

/// Builds [`OrtModel`]s.
#[derive(Debug, Clone, Copy)]
pub struct OrtModelFactory {
    options: SessionOptions,
}

impl OrtModelFactory {
    pub const fn new(options: SessionOptions) -> Self {
        Self { options }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(SessionOptions::from_config(config))
    }
}

impl ModelFactory for OrtModelFactory {
    fn build(&self, role: ModelRole, bytes: &[u8]) -> Result<Arc<dyn InferenceModel>> {
        Ok(Arc::new(OrtModel::from_memory(role, bytes, &self.options)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_selects_provider_chain() {
        let mut options = SessionOptions::from_config(&ModelConfig::default());
        assert_eq!(options.execution_providers().len(), 3);

        options.backend = Backend::Cpu;
        assert_eq!(options.execution_providers().len(), 1);
    }

    #[test]
    fn test_garbage_bytes_fail_as_model_error() {
        let options = SessionOptions {
            backend: Backend::Cpu,
            device_id: 0,
            intra_threads: Some(1),
        };
        let result = OrtModel::from_memory(ModelRole::Encoder, b"not an onnx graph", &options);
        assert!(matches!(result, Err(MapSegError::Model { .. })));
    }
}
