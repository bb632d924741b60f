use std::collections::BTreeMap;

use ndarray::{ArrayD, IxDyn};

use crate::errors::Result;

/// Element type tag carried next to every tensor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    Float32,
    Int64,
}

/// Shaped numeric buffer handed between pipeline stages.
///
/// Backed by `ndarray`, so the element count always equals the product of the
/// shape. Stages pass tensors by value; nothing keeps a second handle.
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    Float32(ArrayD<f32>),
    Int64(ArrayD<i64>),
}

/// Named model inputs or outputs, ordered by name.
pub type TensorMap = BTreeMap<String, Tensor>;

impl Tensor {
    pub fn from_f32(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        Ok(Self::Float32(ArrayD::from_shape_vec(IxDyn(shape), data)?))
    }

    pub fn from_i64(shape: &[usize], data: Vec<i64>) -> Result<Self> {
        Ok(Self::Int64(ArrayD::from_shape_vec(IxDyn(shape), data)?))
    }

    pub fn zeros_f32(shape: &[usize]) -> Self {
        Self::Float32(ArrayD::zeros(IxDyn(shape)))
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Float32(array) => array.shape(),
            Self::Int64(array) => array.shape(),
        }
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            Self::Float32(_) => ElementType::Float32,
            Self::Int64(_) => ElementType::Int64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Float32(array) => array.len(),
            Self::Int64(array) => array.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_f32(&self) -> Option<&ArrayD<f32>> {
        match self {
            Self::Float32(array) => Some(array),
            Self::Int64(_) => None,
        }
    }

    /// Adds a leading batch axis of size 1.
    pub fn with_batch_axis(self) -> Self {
        match self {
            Self::Float32(array) => Self::Float32(array.insert_axis(ndarray::Axis(0))),
            Self::Int64(array) => Self::Int64(array.insert_axis(ndarray::Axis(0))),
        }
    }

    /// Flattened float view in logical (row-major) order.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            Self::Float32(array) => array.iter().copied().collect(),
            Self::Int64(array) => array.iter().map(|&v| v as f32).collect(),
        }
    }
}

impl From<ArrayD<f32>> for Tensor {
    fn from(array: ArrayD<f32>) -> Self {
        Self::Float32(array)
    }
}

impl From<ArrayD<i64>> for Tensor {
    fn from(array: ArrayD<i64>) -> Self {
        Self::Int64(array)
    }
}

/// Looks up the first present name from an ordered candidate list.
pub fn resolve_field<'a>(map: &'a TensorMap, candidates: &[String]) -> Option<(&'a str, &'a Tensor)> {
    candidates
        .iter()
        .find_map(|name| map.get_key_value(name.as_str()))
        .map(|(name, tensor)| (name.as_str(), tensor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::MapSegError;

    #[test]
    fn test_shape_must_match_buffer() {
        assert!(Tensor::from_f32(&[2, 3], vec![0.0; 6]).is_ok());
        let result = Tensor::from_f32(&[2, 3], vec![0.0; 5]);
        assert!(matches!(result, Err(MapSegError::Model { .. })));
    }

    #[test]
    fn test_batch_axis_and_type_tag() -> Result<()> {
        let tensor = Tensor::from_i64(&[2], vec![4, 5])?.with_batch_axis();
        assert_eq!(tensor.shape(), &[1, 2]);
        assert_eq!(tensor.element_type(), ElementType::Int64);
        assert_eq!(tensor.to_f32_vec(), vec![4.0, 5.0]);
        assert!(tensor.as_f32().is_none());
        Ok(())
    }

    #[test]
    fn test_float_view_keeps_shape() -> Result<()> {
        let tensor = Tensor::from_f32(&[1, 2], vec![0.25, 0.75])?;
        let array = tensor.as_f32().unwrap();
        assert_eq!(array.shape(), &[1, 2]);
        assert_eq!(array[[0, 1]], 0.75);
        Ok(())
    }

    #[test]
    fn test_resolve_field_uses_candidate_order() {
        let mut map = TensorMap::new();
        map.insert("embeddings".to_string(), Tensor::zeros_f32(&[1]));
        map.insert("image_embed".to_string(), Tensor::zeros_f32(&[2]));

        let candidates = vec![
            "image_embeddings".to_string(),
            "image_embed".to_string(),
            "embeddings".to_string(),
        ];
        let (name, tensor) = resolve_field(&map, &candidates).unwrap();
        assert_eq!(name, "image_embed");
        assert_eq!(tensor.shape(), &[2]);

        assert!(resolve_field(&map, &["missing".to_string()]).is_none());
    }
}
