use crate::config::{Architecture, PixelScale};
use crate::tensor::{Tensor, TensorMap};

/// Input/output wiring of one encoder + decoder model family.
///
/// Field names differ between exports, so lookups go through ordered
/// candidate lists rather than fixed keys.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchitectureProfile {
    pub architecture: Architecture,
    /// Name of the encoder's image input.
    pub encoder_input: String,
    /// Candidate encoder output names for the image embedding.
    pub embedding_keys: Vec<String>,
    /// Encoder outputs forwarded to the decoder under the same name,
    /// each given as the accepted aliases of that output.
    pub forwarded_features: Vec<Vec<String>>,
    /// Candidate decoder output names for the mask.
    pub mask_keys: Vec<String>,
    /// Candidate decoder output names for per-mask quality scores.
    pub score_keys: Vec<String>,
    /// Whether the decoder wants the empty previous-mask and original-size inputs.
    pub mask_prompt_inputs: bool,
    pub pixel_scale: PixelScale,
    pub default_threshold: f32,
}

pub const LOW_RES_MASK_SIZE: usize = 256;

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl ArchitectureProfile {
    pub fn for_architecture(architecture: Architecture) -> Self {
        match architecture {
            Architecture::Standard => Self {
                architecture,
                encoder_input: "images".to_string(),
                embedding_keys: names(&["image_embeddings", "embeddings", "image_embed"]),
                forwarded_features: Vec::new(),
                mask_keys: names(&["masks", "output", "low_res_masks"]),
                score_keys: names(&["iou_predictions", "scores"]),
                mask_prompt_inputs: false,
                pixel_scale: PixelScale::Unit,
                default_threshold: 0.5,
            },
            // Lightweight model: softer probabilities, so a lower cut-off.
            Architecture::HieraTiny => Self {
                architecture,
                encoder_input: "input".to_string(),
                embedding_keys: names(&["image_embeddings", "image_embed", "embeddings"]),
                forwarded_features: vec![
                    names(&["high_res_features_0", "high_res_feats_0"]),
                    names(&["high_res_features_1", "high_res_feats_1"]),
                ],
                mask_keys: names(&["masks", "low_res_masks", "output"]),
                score_keys: names(&["iou_predictions", "scores"]),
                mask_prompt_inputs: true,
                pixel_scale: PixelScale::Unit,
                default_threshold: 0.4,
            },
        }
    }

    /// Decoder inputs beyond embedding and prompt.
    ///
    /// Forwarded encoder features are looked up by alias and renamed to the
    /// first alias, which is the name the decoder declares. Missing features
    /// are skipped; the decoder reports what it lacks.
    pub fn decoder_extras(
        &self,
        encoder_outputs: &mut TensorMap,
        image_height: u32,
        image_width: u32,
    ) -> crate::errors::Result<Vec<(String, Tensor)>> {
        let mut extras = Vec::new();

        for aliases in &self.forwarded_features {
            let Some(canonical) = aliases.first() else {
                continue;
            };
            if let Some(tensor) = aliases.iter().find_map(|alias| encoder_outputs.remove(alias)) {
                extras.push((canonical.clone(), tensor));
            }
        }

        if self.mask_prompt_inputs {
            extras.push((
                "mask_input".to_string(),
                Tensor::zeros_f32(&[1, 1, LOW_RES_MASK_SIZE, LOW_RES_MASK_SIZE]),
            ));
            extras.push(("has_mask_input".to_string(), Tensor::zeros_f32(&[1])));
            extras.push((
                "orig_im_size".to_string(),
                Tensor::from_i64(&[2], vec![i64::from(image_height), i64::from(image_width)])?,
            ));
        }

        Ok(extras)
    }
}
