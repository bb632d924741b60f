use image::{imageops, imageops::FilterType, DynamicImage, RgbaImage};
use ndarray::Array4;
use tracing::debug;

use crate::config::PixelScale;
use crate::errors::{MapSegError, Result};
use crate::source::{is_http_url, local_path};
use crate::tensor::Tensor;

/// Interleaved RGBA8 drawing surface, the shape a captured view arrives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanvasSurface {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// Any of the image forms the preprocessor accepts.
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// `http(s)://` URL, `file://` URL or filesystem path.
    Url(String),
    Bitmap(DynamicImage),
    Canvas(CanvasSurface),
}

impl From<DynamicImage> for ImageSource {
    fn from(image: DynamicImage) -> Self {
        Self::Bitmap(image)
    }
}

impl From<CanvasSurface> for ImageSource {
    fn from(canvas: CanvasSurface) -> Self {
        Self::Canvas(canvas)
    }
}

impl From<&str> for ImageSource {
    fn from(url: &str) -> Self {
        Self::Url(url.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessedImage {
    /// `[1, 3, height, width]`, channel-planar RGB.
    pub tensor: Tensor,
    pub width: u32,
    pub height: u32,
    pub original_width: u32,
    pub original_height: u32,
}

/// Aspect-preserving target size with the long side at `max_size`.
pub fn resized_dimensions(width: u32, height: u32, max_size: u32) -> (u32, u32) {
    let scale_short = |short: u32, long: u32| -> u32 {
        ((f64::from(short) / f64::from(long)) * f64::from(max_size))
            .round()
            .max(1.0) as u32
    };

    if width > height {
        (max_size, scale_short(height, width))
    } else {
        (scale_short(width, height), max_size)
    }
}

/// Reorders an interleaved RGBA buffer into planar `[1, 3, H, W]`.
///
/// One row-major pass per channel; alpha is dropped.
pub fn planar_rgb(rgba: &[u8], width: u32, height: u32, scale: PixelScale) -> Result<Array4<f32>> {
    let (w, h) = (width as usize, height as usize);
    if rgba.len() != w * h * 4 {
        return Err(MapSegError::UnsupportedImageSource {
            reason: format!(
                "RGBA buffer holds {} bytes, expected {} for {width}x{height}",
                rgba.len(),
                w * h * 4
            ),
        });
    }

    let divisor = match scale {
        PixelScale::Raw => 1.0,
        PixelScale::Unit => 255.0,
    };

    let mut data = Vec::with_capacity(3 * w * h);
    for channel in 0..3 {
        for y in 0..h {
            for x in 0..w {
                data.push(f32::from(rgba[(y * w + x) * 4 + channel]) / divisor);
            }
        }
    }

    Ok(Array4::from_shape_vec((1, 3, h, w), data)?)
}

/// Turns any [`ImageSource`] into the encoder's input tensor.
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    scale: PixelScale,
    filter: FilterType,
    client: reqwest::Client,
}

impl ImagePreprocessor {
    pub fn new(scale: PixelScale) -> Self {
        Self {
            scale,
            filter: FilterType::Triangle,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_filter(mut self, filter: FilterType) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub async fn preprocess(&self, source: ImageSource, target_max_size: u32) -> Result<PreprocessedImage> {
        let bitmap = self.decode(source).await?;
        self.preprocess_bitmap(&bitmap, target_max_size)
    }

    pub fn preprocess_bitmap(&self, bitmap: &RgbaImage, target_max_size: u32) -> Result<PreprocessedImage> {
        let (original_width, original_height) = bitmap.dimensions();
        if original_width == 0 || original_height == 0 {
            return Err(MapSegError::UnsupportedImageSource {
                reason: format!("image has no pixels ({original_width}x{original_height})"),
            });
        }

        let (width, height) = resized_dimensions(original_width, original_height, target_max_size);
        let resized = imageops::resize(bitmap, width, height, self.filter);
        let tensor = planar_rgb(resized.as_raw(), width, height, self.scale)?;

        debug!(
            original_width,
            original_height, width, height, "preprocessed image"
        );

        Ok(PreprocessedImage {
            tensor: Tensor::Float32(tensor.into_dyn()),
            width,
            height,
            original_width,
            original_height,
        })
    }

    /// Normalizes every source kind to an RGBA8 bitmap.
    async fn decode(&self, source: ImageSource) -> Result<RgbaImage> {
        match source {
            ImageSource::Bitmap(image) => Ok(image.into_rgba8()),
            ImageSource::Canvas(canvas) => {
                let CanvasSurface { width, height, rgba } = canvas;
                let len = rgba.len();
                RgbaImage::from_raw(width, height, rgba).ok_or_else(|| MapSegError::UnsupportedImageSource {
                    reason: format!("canvas buffer of {len} bytes does not cover {width}x{height} RGBA"),
                })
            }
            ImageSource::Url(url) => {
                let bytes = self.load_url(&url).await?;
                let image = image::load_from_memory(&bytes).map_err(|e| MapSegError::ImageLoad {
                    location: url.clone(),
                    source: Box::new(e),
                })?;
                Ok(image.into_rgba8())
            }
        }
    }

    async fn load_url(&self, url: &str) -> Result<Vec<u8>> {
        let load_error = |e: Box<dyn std::error::Error + Send + Sync>| MapSegError::ImageLoad {
            location: url.to_string(),
            source: e,
        };

        if is_http_url(url) {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| load_error(Box::new(e)))?;
            let bytes = response.bytes().await.map_err(|e| load_error(Box::new(e)))?;
            return Ok(bytes.to_vec());
        }

        if let Some((scheme, _)) = url.split_once("://") {
            if scheme != "file" {
                return Err(MapSegError::UnsupportedImageSource {
                    reason: format!("unsupported URL scheme `{scheme}`"),
                });
            }
        }

        tokio::fs::read(local_path(url))
            .await
            .map_err(|e| load_error(Box::new(e)))
    }
}
