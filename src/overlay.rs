use crate::bounding_box::{Prediction, CELL_PHONE_LABEL, PERSON_LABEL};
use serde::Serialize;

const LINE_WIDTH: f32 = 2.0;
const LABEL_HEIGHT: f32 = 20.0;
const LABEL_PADDING: f32 = 10.0;
const TEXT_INSET: f32 = 5.0;
const TEXT_BASELINE_OFFSET: f32 = 5.0;
// Average advance of a proportional sans-serif glyph, relative to its size.
const GLYPH_ADVANCE_RATIO: f32 = 0.6;

pub const LABEL_FONT: Font = Font {
    size_px: 16.0,
    family: "Arial",
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Color {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Color {
    pub const RED: Color = Color::rgb(255, 0, 0);
    pub const BLUE: Color = Color::rgb(0, 0, 255);
    pub const WHITE: Color = Color::rgb(255, 255, 255);
    pub const GRAY: Color = Color::rgb(128, 128, 128);

    pub const fn rgb(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Font {
    pub size_px: f32,
    pub family: &'static str,
}

impl Font {
    pub fn css(&self) -> String {
        format!("{}px {}", self.size_px, self.family)
    }
}

/// Minimal 2D drawing surface, shaped after the HTML canvas context.
pub trait Canvas {
    /// Sets the intrinsic pixel size of the surface.
    fn resize(&mut self, width: u32, height: u32);
    fn dimensions(&self) -> (u32, u32);
    fn clear(&mut self);
    fn stroke_rect(&mut self, rect: Rect, color: Color, line_width: f32);
    fn fill_rect(&mut self, rect: Rect, color: Color);
    fn measure_text(&self, text: &str, font: &Font) -> f32;
    fn fill_text(&mut self, text: &str, x: f32, y: f32, color: Color, font: &Font);
}

pub fn label_color(label: &str) -> Color {
    match label {
        PERSON_LABEL => Color::RED,
        CELL_PHONE_LABEL => Color::BLUE,
        _ => Color::GRAY,
    }
}

pub fn display_name(label: &str) -> String {
    match label {
        PERSON_LABEL => "Person".to_string(),
        CELL_PHONE_LABEL => "Smartphone".to_string(),
        other => {
            let mut chars = other.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        }
    }
}

pub fn label_text(prediction: &Prediction) -> String {
    format!(
        "{} {}%",
        display_name(&prediction.label),
        (prediction.confidence * 100.0).round() as u32
    )
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OverlayRenderer;

impl OverlayRenderer {
    pub fn new() -> Self {
        Self
    }

    /// Redraws `canvas` from scratch at the frame's natural size.
    pub fn render<C: Canvas + ?Sized>(
        &self,
        canvas: &mut C,
        predictions: &[Prediction],
        frame_width: u32,
        frame_height: u32,
    ) {
        canvas.resize(frame_width, frame_height);
        canvas.clear();

        for prediction in predictions {
            let bbox = prediction.bbox;
            let color = label_color(&prediction.label);

            canvas.stroke_rect(
                Rect::new(bbox.x, bbox.y, bbox.width, bbox.height),
                color,
                LINE_WIDTH,
            );

            let label = label_text(prediction);
            let text_width = canvas.measure_text(&label, &LABEL_FONT);
            canvas.fill_rect(
                Rect::new(
                    bbox.x,
                    bbox.y - LABEL_HEIGHT,
                    text_width + LABEL_PADDING,
                    LABEL_HEIGHT,
                ),
                color,
            );
            canvas.fill_text(
                &label,
                bbox.x + TEXT_INSET,
                bbox.y - TEXT_BASELINE_OFFSET,
                Color::WHITE,
                &LABEL_FONT,
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DrawCommand {
    Clear {
        width: u32,
        height: u32,
    },
    StrokeRect {
        rect: Rect,
        color: Color,
        line_width: f32,
    },
    FillRect {
        rect: Rect,
        color: Color,
    },
    FillText {
        text: String,
        x: f32,
        y: f32,
        color: Color,
        font: String,
    },
}

/// Records draw calls instead of rasterizing them. Serialized as-is for
/// front-ends that replay the list onto their own canvas element.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DisplayList {
    width: u32,
    height: u32,
    commands: Vec<DrawCommand>,
}

impl DisplayList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[DrawCommand] {
        &self.commands
    }

    /// Replays the recorded commands onto another surface.
    pub fn replay<C: Canvas + ?Sized>(&self, canvas: &mut C) {
        canvas.resize(self.width, self.height);
        for command in &self.commands {
            match command {
                DrawCommand::Clear { .. } => canvas.clear(),
                DrawCommand::StrokeRect {
                    rect,
                    color,
                    line_width,
                } => canvas.stroke_rect(*rect, *color, *line_width),
                DrawCommand::FillRect { rect, color } => canvas.fill_rect(*rect, *color),
                DrawCommand::FillText {
                    text, x, y, color, ..
                } => canvas.fill_text(text, *x, *y, *color, &LABEL_FONT),
            }
        }
    }
}

impl Canvas for DisplayList {
    fn resize(&mut self, width: u32, height: u32) {
        // Like an HTML canvas, assigning the size discards the contents.
        self.width = width;
        self.height = height;
        self.commands.clear();
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn clear(&mut self) {
        self.commands.clear();
        self.commands.push(DrawCommand::Clear {
            width: self.width,
            height: self.height,
        });
    }

    fn stroke_rect(&mut self, rect: Rect, color: Color, line_width: f32) {
        self.commands.push(DrawCommand::StrokeRect {
            rect,
            color,
            line_width,
        });
    }

    fn fill_rect(&mut self, rect: Rect, color: Color) {
        self.commands.push(DrawCommand::FillRect { rect, color });
    }

    fn measure_text(&self, text: &str, font: &Font) -> f32 {
        text.chars().count() as f32 * font.size_px * GLYPH_ADVANCE_RATIO
    }

    fn fill_text(&mut self, text: &str, x: f32, y: f32, color: Color, font: &Font) {
        self.commands.push(DrawCommand::FillText {
            text: text.to_string(),
            x,
            y,
            color,
            font: font.css(),
        });
    }
}
