use crate::overlay::{Canvas, Color, Font, Rect};
use opencv::{
    core::{self, Mat, Point, Scalar, Size, Vector},
    imgcodecs, imgproc,
    prelude::*,
};
use thiserror::Error;

// Hershey simplex glyphs are about 22px tall at scale 1.0.
const HERSHEY_PX_PER_SCALE: f64 = 22.0;

#[derive(Error, Debug)]
pub enum CvUtilsError {
    #[error("Failed to encode frame: {0}")]
    EncodeFrameFailed(opencv::Error),
    #[error("Failed to decode frame: {0}")]
    DecodeFrameFailed(opencv::Error),
    #[error("OpenCV error: {0}")]
    OpenCvError(#[from] opencv::Error),
}

/// Rasterizes overlay draw calls directly onto a captured frame.
///
/// `Canvas` calls cannot fail, so the first OpenCV error is kept and returned
/// by [`MatCanvas::finish`]; later calls become no-ops.
pub struct MatCanvas {
    mat: Mat,
    error: Option<opencv::Error>,
}

impl MatCanvas {
    pub fn new(mat: Mat) -> Self {
        Self { mat, error: None }
    }

    pub fn finish(self) -> Result<Mat, CvUtilsError> {
        match self.error {
            Some(err) => Err(CvUtilsError::OpenCvError(err)),
            None => Ok(self.mat),
        }
    }

    fn record(&mut self, result: opencv::Result<()>) {
        if let Err(err) = result {
            if self.error.is_none() {
                tracing::warn!("Overlay drawing failed: {}", err);
                self.error = Some(err);
            }
        }
    }

    fn skip(&self) -> bool {
        self.error.is_some()
    }
}

fn scalar(color: Color) -> Scalar {
    Scalar::new(color.blue as f64, color.green as f64, color.red as f64, 0.0)
}

fn font_scale(font: &Font) -> f64 {
    font.size_px as f64 / HERSHEY_PX_PER_SCALE
}

fn cv_rect(rect: Rect) -> core::Rect {
    core::Rect::new(
        rect.x.round() as i32,
        rect.y.round() as i32,
        rect.width.round() as i32,
        rect.height.round() as i32,
    )
}

impl Canvas for MatCanvas {
    fn resize(&mut self, width: u32, height: u32) {
        // An empty display list has no size of its own.
        if self.skip() || width == 0 || height == 0 || self.dimensions() == (width, height) {
            return;
        }
        let mut resized = Mat::default();
        let result = imgproc::resize(
            &self.mat,
            &mut resized,
            Size::new(width as i32, height as i32),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        );
        if result.is_ok() {
            self.mat = resized;
        }
        self.record(result);
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.mat.cols() as u32, self.mat.rows() as u32)
    }

    // The frame itself is the background.
    fn clear(&mut self) {}

    fn stroke_rect(&mut self, rect: Rect, color: Color, line_width: f32) {
        if self.skip() {
            return;
        }
        let result = imgproc::rectangle(
            &mut self.mat,
            cv_rect(rect),
            scalar(color),
            line_width.round() as i32,
            imgproc::LINE_8,
            0,
        );
        self.record(result);
    }

    fn fill_rect(&mut self, rect: Rect, color: Color) {
        if self.skip() {
            return;
        }
        let result = imgproc::rectangle(
            &mut self.mat,
            cv_rect(rect),
            scalar(color),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        );
        self.record(result);
    }

    fn measure_text(&self, text: &str, font: &Font) -> f32 {
        let mut baseline = 0;
        imgproc::get_text_size(
            text,
            imgproc::FONT_HERSHEY_SIMPLEX,
            font_scale(font),
            1,
            &mut baseline,
        )
        .map(|size| size.width as f32)
        .unwrap_or(0.0)
    }

    fn fill_text(&mut self, text: &str, x: f32, y: f32, color: Color, font: &Font) {
        if self.skip() {
            return;
        }
        let result = imgproc::put_text(
            &mut self.mat,
            text,
            Point::new(x.round() as i32, y.round() as i32),
            imgproc::FONT_HERSHEY_SIMPLEX,
            font_scale(font),
            scalar(color),
            1,
            imgproc::LINE_AA,
            false,
        );
        self.record(result);
    }
}

pub fn decode_jpg(bytes: &[u8]) -> Result<Mat, CvUtilsError> {
    imgcodecs::imdecode(&Vector::<u8>::from_slice(bytes), imgcodecs::IMREAD_COLOR)
        .map_err(CvUtilsError::DecodeFrameFailed)
}

pub fn encode_jpg(mat: &Mat, quality: i32) -> Result<Vec<u8>, CvUtilsError> {
    let mut buf = Vector::<u8>::new();
    let params = Vector::from_slice(&[imgcodecs::IMWRITE_JPEG_QUALITY, quality]);
    imgcodecs::imencode(".jpg", mat, &mut buf, &params).map_err(CvUtilsError::EncodeFrameFailed)?;
    Ok(buf.into())
}
