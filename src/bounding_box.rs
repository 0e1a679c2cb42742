use serde::Serialize;

pub const PERSON_LABEL: &str = "person";
pub const CELL_PHONE_LABEL: &str = "cell phone";

/// Box in the pixel space of the frame that was submitted for detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub bbox: BoundingBox,
    pub label: String,
    pub confidence: f32,
}

pub type DetectionBatch = Vec<Prediction>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DetectionCounters {
    pub person_count: u32,
    pub device_count: u32,
}

impl DetectionCounters {
    /// Counts only what is in `batch`; previous counters are never carried over.
    pub fn from_batch(batch: &[Prediction]) -> Self {
        batch
            .iter()
            .fold(Self::default(), |mut counters, prediction| {
                match prediction.label.as_str() {
                    PERSON_LABEL => counters.person_count += 1,
                    CELL_PHONE_LABEL => counters.device_count += 1,
                    _ => {}
                }
                counters
            })
    }
}
