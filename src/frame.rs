use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{ImageBuffer, RgbImage};
use std::io::Cursor;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// Errors raised while turning a clip into a frame
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("clip is empty")]
    Empty,

    #[error("malformed clip: {0}")]
    Malformed(String),

    #[error("frame decoder failed: {0}")]
    Process(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded RGB8 frame, row-major, 3 bytes per pixel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    buffer: Vec<u8>,
}

impl Frame {
    /// Build a frame from raw RGB bytes
    pub fn from_raw_rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * 3;
        if width == 0 || height == 0 {
            return Err(FrameError::Malformed(format!(
                "zero-sized frame {}x{}",
                width, height
            )));
        }
        if data.len() != expected {
            return Err(FrameError::Malformed(format!(
                "buffer size mismatch: expected {} bytes, got {}",
                expected,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            buffer: data,
        })
    }

    /// Decode an encoded still image (PNG or JPEG)
    pub fn from_image_bytes(data: &[u8]) -> Result<Self, FrameError> {
        if data.is_empty() {
            return Err(FrameError::Empty);
        }
        let img = image::load_from_memory(data)
            .map_err(|e| FrameError::Malformed(format!("failed to decode image: {}", e)))?;
        let rgb = img.to_rgb8();
        Self::from_raw_rgb(rgb.width(), rgb.height(), rgb.into_raw())
    }

    /// A frame filled with one color
    pub fn solid(width: u32, height: u32, color: [u8; 3]) -> Self {
        let buffer = color
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self {
            width,
            height,
            buffer,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Color at (x, y); black outside the frame
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        if x >= self.width || y >= self.height {
            return [0, 0, 0];
        }
        let idx = ((y as usize * self.width as usize) + x as usize) * 3;
        [self.buffer[idx], self.buffer[idx + 1], self.buffer[idx + 2]]
    }

    fn to_image(&self) -> Result<RgbImage, FrameError> {
        ImageBuffer::from_raw(self.width, self.height, self.buffer.clone())
            .ok_or_else(|| FrameError::Malformed("buffer does not match dimensions".to_string()))
    }

    /// Encode as PNG bytes
    pub fn to_png(&self) -> Result<Vec<u8>, FrameError> {
        let img = self.to_image()?;
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .map_err(|e| FrameError::Malformed(format!("failed to encode PNG: {}", e)))?;
        Ok(bytes)
    }

    /// PNG data URL suitable for multimodal chat messages and seed images
    pub fn to_data_url(&self) -> Result<String, FrameError> {
        Ok(format!("data:image/png;base64,{}", STANDARD.encode(self.to_png()?)))
    }
}

/// Decodes a clip and exposes its last frame
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn extract_last_frame(&self, clip: &[u8]) -> Result<Frame, FrameError>;
}

/// Treats each clip as a single encoded still image.
///
/// Used with world models that return keyframes instead of video, and in tests.
#[derive(Debug, Clone, Default)]
pub struct StillImageExtractor;

#[async_trait]
impl FrameExtractor for StillImageExtractor {
    async fn extract_last_frame(&self, clip: &[u8]) -> Result<Frame, FrameError> {
        Frame::from_image_bytes(clip)
    }
}

/// Extracts the last video frame by running the `ffmpeg` binary
#[derive(Debug, Clone)]
pub struct FfmpegFrameExtractor {
    binary: PathBuf,
}

impl Default for FfmpegFrameExtractor {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegFrameExtractor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl FrameExtractor for FfmpegFrameExtractor {
    async fn extract_last_frame(&self, clip: &[u8]) -> Result<Frame, FrameError> {
        if clip.is_empty() {
            return Err(FrameError::Empty);
        }

        let workdir = tempfile::tempdir()?;
        let input = workdir.path().join("clip.mp4");
        let output = workdir.path().join("last.png");
        tokio::fs::write(&input, clip).await?;

        // -update 1 keeps overwriting the single output image, leaving the last frame
        let result = Command::new(&self.binary)
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-i")
            .arg(&input)
            .args(["-update", "1", "-f", "image2", "-c:v", "png"])
            .arg(&output)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| FrameError::Process(format!("failed to run {}: {}", self.binary.display(), e)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(FrameError::Malformed(stderr.trim().to_string()));
        }

        let png = tokio::fs::read(&output)
            .await
            .map_err(|_| FrameError::Malformed("decoder produced no frames".to_string()))?;
        debug!(clip_bytes = clip.len(), png_bytes = png.len(), "extracted last frame");
        Frame::from_image_bytes(&png)
    }
}
