use serde::{Deserialize, Serialize};

use crate::errors::{MapSegError, Result};
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointLabel {
    Background,
    Foreground,
}

impl PointLabel {
    pub const fn value(self) -> f32 {
        match self {
            Self::Background => 0.0,
            Self::Foreground => 1.0,
        }
    }
}

/// Click point in normalized image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointPrompt {
    pub x: f64,
    pub y: f64,
    /// Foreground when unset.
    pub label: Option<PointLabel>,
}

impl PointPrompt {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y, label: None }
    }

    pub const fn with_label(mut self, label: PointLabel) -> Self {
        self.label = Some(label);
        self
    }
}

/// Prompt tensors: `coords` is `[N, 2]` in pixels, `labels` is `[N]`.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPrompt {
    pub coords: Tensor,
    pub labels: Tensor,
}

pub struct PromptEncoder;

impl PromptEncoder {
    pub fn encode(points: &[PointPrompt], image_width: u32, image_height: u32) -> Result<EncodedPrompt> {
        if points.is_empty() {
            return Err(MapSegError::EmptyPrompt);
        }

        let (width, height) = (f64::from(image_width), f64::from(image_height));
        let coords = points
            .iter()
            .flat_map(|p| [(p.x * width) as f32, (p.y * height) as f32])
            .collect();
        let labels = points
            .iter()
            .map(|p| p.label.unwrap_or(PointLabel::Foreground).value())
            .collect();

        Ok(EncodedPrompt {
            coords: Tensor::from_f32(&[points.len(), 2], coords)?,
            labels: Tensor::from_f32(&[points.len()], labels)?,
        })
    }
}
