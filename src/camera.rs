use async_trait::async_trait;
use bytes::Bytes;
use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, DynamicImage};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Failed to load image: {0}")]
    LoadImageFailed(image::ImageError),
    #[error("Failed to encode frame: {0}")]
    EncodeFrameFailed(image::ImageError),
    #[error("Frame source `{0}` is not available in this build")]
    Unsupported(&'static str),
    #[error("`camera.image_path` must be set for the image frame source")]
    MissingImagePath,
    #[cfg(feature = "opencv")]
    #[error("Failed to open camera: {0}")]
    OpenCameraFailed(opencv::Error),
    #[cfg(feature = "opencv")]
    #[error("Failed to read frame: {0}")]
    ReadFrameFailed(opencv::Error),
    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCvError(#[from] opencv::Error),
    #[cfg(feature = "opencv")]
    #[error(transparent)]
    Encode(#[from] crate::cv_utils::CvUtilsError),
}

/// A JPEG frame together with its natural pixel dimensions.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub jpeg: Bytes,
    pub width: u32,
    pub height: u32,
}

#[async_trait]
pub trait FrameSource: Send + Sync + 'static {
    fn is_ready(&self) -> bool;

    /// Latest frame, or `None` while the device is still warming up.
    async fn capture(&self) -> Result<Option<CapturedFrame>, CameraError>;
}

/// Serves the same still image on every capture. Used when no camera device
/// is attached and as a deterministic source in tests.
#[derive(Debug, Clone)]
pub struct StillImageSource {
    frame: CapturedFrame,
}

impl StillImageSource {
    pub fn from_path(
        path: impl AsRef<Path>,
        width: u32,
        height: u32,
        quality: u8,
    ) -> Result<Self, CameraError> {
        let image = image::open(path).map_err(CameraError::LoadImageFailed)?;
        Self::from_image(image, width, height, quality)
    }

    pub fn from_image(
        image: DynamicImage,
        width: u32,
        height: u32,
        quality: u8,
    ) -> Result<Self, CameraError> {
        let image = if image.width() != width || image.height() != height {
            image.resize_exact(width, height, FilterType::Triangle)
        } else {
            image
        };
        let jpeg = encode_jpeg(&image, quality)?;
        tracing::debug!("Still image source ready: {}x{}, {} bytes", width, height, jpeg.len());

        Ok(Self {
            frame: CapturedFrame {
                jpeg: Bytes::from(jpeg),
                width,
                height,
            },
        })
    }
}

#[async_trait]
impl FrameSource for StillImageSource {
    fn is_ready(&self) -> bool {
        true
    }

    async fn capture(&self) -> Result<Option<CapturedFrame>, CameraError> {
        Ok(Some(self.frame.clone()))
    }
}

pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, CameraError> {
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    image
        .to_rgb8()
        .write_with_encoder(encoder)
        .map_err(CameraError::EncodeFrameFailed)?;
    Ok(buf)
}

#[cfg(feature = "opencv")]
pub use device::Camera;

#[cfg(feature = "opencv")]
mod device {
    use super::{CameraError, CapturedFrame, FrameSource};
    use crate::config::CameraConfig;
    use crate::cv_utils::encode_jpg;
    use async_trait::async_trait;
    use bytes::Bytes;
    use opencv::{core::Mat, prelude::*, videoio};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    pub struct Camera {
        capture: Mutex<videoio::VideoCapture>,
        opened: AtomicBool,
        jpeg_quality: i32,
    }

    impl Camera {
        pub async fn new(config: &CameraConfig) -> Result<Self, CameraError> {
            let mut capture = videoio::VideoCapture::new(config.device_index, videoio::CAP_ANY)
                .map_err(CameraError::OpenCameraFailed)?;
            capture.set(videoio::CAP_PROP_FRAME_WIDTH, config.width as f64)?;
            capture.set(videoio::CAP_PROP_FRAME_HEIGHT, config.height as f64)?;
            let opened = capture.is_opened()?;

            Ok(Self {
                capture: Mutex::new(capture),
                opened: AtomicBool::new(opened),
                jpeg_quality: config.jpeg_quality as i32,
            })
        }
    }

    #[async_trait]
    impl FrameSource for Camera {
        fn is_ready(&self) -> bool {
            self.opened.load(Ordering::Relaxed)
        }

        async fn capture(&self) -> Result<Option<CapturedFrame>, CameraError> {
            let mut cam = self.capture.lock().await;
            let mut frame = Mat::default();
            if !cam.read(&mut frame).map_err(CameraError::ReadFrameFailed)? || frame.empty() {
                return Ok(None);
            }
            drop(cam);

            let jpeg = encode_jpg(&frame, self.jpeg_quality)?;
            Ok(Some(CapturedFrame {
                jpeg: Bytes::from(jpeg),
                width: frame.cols() as u32,
                height: frame.rows() as u32,
            }))
        }
    }
}
