use serde::Serialize;
use tracing::debug;

use crate::config::ModelConfig;
use crate::errors::{MapSegError, Result};
use crate::geometry::{self, Point};
use crate::tensor::{resolve_field, TensorMap};

/// One mask plane taken out of the decoder outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskPlane {
    /// Row-major probabilities, `width * height` long.
    pub data: Vec<f32>,
    pub width: usize,
    pub height: usize,
    /// Predicted quality of the chosen plane, when the decoder reports one.
    pub score: Option<f32>,
}

/// Picks the mask output and, among several candidate masks, the best scored one.
///
/// The mask must be at least two-dimensional; the last two axes are height
/// and width and any leading axes enumerate candidate planes.
pub fn extract_mask(outputs: &TensorMap, mask_keys: &[String], score_keys: &[String]) -> Result<MaskPlane> {
    let (name, tensor) = resolve_field(outputs, mask_keys).ok_or_else(|| {
        MapSegError::invalid_mask(format!(
            "no mask output among {:?} (available: {:?})",
            mask_keys,
            outputs.keys().collect::<Vec<_>>()
        ))
    })?;

    let dims = tensor.shape();
    if dims.len() < 2 {
        return Err(MapSegError::invalid_mask(format!(
            "mask `{name}` has {} dims, need at least 2",
            dims.len()
        )));
    }
    let (height, width) = (dims[dims.len() - 2], dims[dims.len() - 1]);
    if height == 0 || width == 0 {
        return Err(MapSegError::invalid_mask(format!("mask `{name}` is {width}x{height}")));
    }

    let values = tensor.to_f32_vec();
    let plane_len = width * height;
    let planes = values.len() / plane_len;
    if planes == 0 {
        return Err(MapSegError::invalid_mask(format!(
            "mask `{name}` holds no {width}x{height} plane"
        )));
    }

    let scores = resolve_field(outputs, score_keys).map(|(_, t)| t.to_f32_vec());
    let (index, score) = match scores {
        Some(scores) if planes > 1 && scores.len() == planes => scores
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map_or((0, None), |(i, s)| (i, Some(s))),
        Some(scores) if scores.len() == planes => (0, scores.first().copied()),
        _ => (0, None),
    };
    debug!(mask = name, planes, selected = index, ?score, "mask extracted");

    let start = index * plane_len;
    Ok(MaskPlane {
        data: values[start..start + plane_len].to_vec(),
        width,
        height,
        score,
    })
}

/// Cells strictly above `threshold` become 1, the rest 0.
pub fn binarize(mask: &[f32], threshold: f32) -> Vec<u8> {
    mask.iter().map(|&v| u8::from(v > threshold)).collect()
}

/// Foreground cells hit by a `ceil(sqrt(max_points))` grid laid on each axis.
///
/// Grid cell `(gx, gy)` samples pixel `(floor(gx / grid * width), floor(gy / grid * height))`,
/// so small masks can yield repeated points. Returned points are pixel
/// coordinates normalized by the mask size.
pub fn sample_boundary_points(binary: &[u8], width: usize, height: usize, max_points: usize) -> Vec<Point> {
    let cells = width * height;
    if cells == 0 || binary.len() < cells {
        return Vec::new();
    }

    let grid = (max_points.max(1) as f64).sqrt().ceil() as usize;
    let sample = |g: usize, extent: usize| g * extent / grid;

    let mut points = Vec::new();
    for gy in 0..grid {
        let py = sample(gy, height);
        for gx in 0..grid {
            let px = sample(gx, width);
            if binary[py * width + px] != 0 {
                points.push([px as f64 / width as f64, py as f64 / height as f64]);
            }
        }
    }
    points
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolygonOptions {
    pub threshold: f32,
    pub max_boundary_points: usize,
    pub use_convex_hull: bool,
    pub simplify: bool,
    pub simplify_tolerance: f64,
}

impl PolygonOptions {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            threshold: config.threshold(),
            max_boundary_points: config.max_boundary_points,
            use_convex_hull: config.use_convex_hull,
            simplify: config.simplify_polygon,
            simplify_tolerance: config.simplify_tolerance,
        }
    }
}

/// Traces a closed polygon in normalized coordinates around the mask.
///
/// An empty mask gives an empty polygon, not an error.
pub fn to_polygon(mask: &[f32], width: usize, height: usize, options: &PolygonOptions) -> Result<Vec<Point>> {
    if width == 0 || height == 0 {
        return Err(MapSegError::invalid_mask(format!("mask is {width}x{height}")));
    }
    let cells = width * height;
    if mask.len() < cells {
        return Err(MapSegError::invalid_mask(format!(
            "mask has {} values, {width}x{height} needs {cells}",
            mask.len()
        )));
    }

    let binary = binarize(&mask[..cells], options.threshold);
    let boundary = sample_boundary_points(&binary, width, height, options.max_boundary_points);
    if boundary.is_empty() {
        return Ok(Vec::new());
    }

    let mut polygon = if options.use_convex_hull {
        geometry::convex_hull(&boundary)
    } else {
        boundary
    };
    if options.simplify {
        polygon = geometry::simplify(&polygon, options.simplify_tolerance);
    }
    Ok(geometry::close(polygon))
}

/// Statistics over mask values above zero; all zero when there are none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ConfidenceMetrics {
    pub mean: f32,
    pub max: f32,
    pub min: f32,
    /// Fraction of all cells above zero, in [0, 1].
    pub area: f32,
}

pub fn confidence_metrics(mask: &[f32]) -> ConfidenceMetrics {
    let mut sum = 0.0f64;
    let mut max = f32::NEG_INFINITY;
    let mut min = f32::INFINITY;
    let mut positive = 0usize;

    for &v in mask.iter().filter(|&&v| v > 0.0) {
        sum += f64::from(v);
        max = max.max(v);
        min = min.min(v);
        positive += 1;
    }

    if positive == 0 {
        return ConfidenceMetrics::default();
    }
    ConfidenceMetrics {
        mean: (sum / positive as f64) as f32,
        max,
        min,
        area: positive as f32 / mask.len() as f32,
    }
}
