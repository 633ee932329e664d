use std::sync::{Arc, OnceLock};

use anyhow::Context as _;
use futures::future::BoxFuture;

use crate::clip::image_clip::ImageClip;
use crate::clip::{Clip, ClipMeta, ClipTick};
use crate::foundation::core::UNBOUNDED;
use crate::foundation::error::{MontageError, MontageResult};
use crate::media::frame::VideoFrame;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextAlign {
    Start,
    #[default]
    Middle,
    End,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TextStyle {
    pub width: u32,
    pub height: u32,
    pub font_family: String,
    pub font_size: f32,
    /// Straight (non-premultiplied) RGBA.
    pub color: [u8; 4],
    pub background: Option<[u8; 4]>,
    pub align: TextAlign,
    /// Line height as a multiple of the font size.
    pub line_height: f32,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            width: 640,
            height: 120,
            font_family: "sans-serif".to_owned(),
            font_size: 48.0,
            color: [255, 255, 255, 255],
            background: None,
            align: TextAlign::Middle,
            line_height: 1.2,
        }
    }
}

/// Text rasterized once through SVG, then served like a still image.
pub struct TextClip {
    inner: ImageClip,
}

impl TextClip {
    pub fn new(text: &str, style: &TextStyle) -> MontageResult<Self> {
        let frame = render_text(text, style)?;
        Ok(Self {
            inner: ImageClip::from_frame(frame)?,
        })
    }
}

impl Clip for TextClip {
    fn ready(&mut self) -> BoxFuture<'_, MontageResult<ClipMeta>> {
        self.inner.ready()
    }

    fn tick(&mut self, time: i64) -> BoxFuture<'_, MontageResult<ClipTick>> {
        self.inner.tick(time)
    }

    fn destroy(&mut self) {
        self.inner.destroy();
    }
}

fn system_fontdb() -> Arc<usvg::fontdb::Database> {
    static FONTS: OnceLock<Arc<usvg::fontdb::Database>> = OnceLock::new();
    Arc::clone(FONTS.get_or_init(|| {
        let mut db = usvg::fontdb::Database::new();
        db.load_system_fonts();
        tracing::debug!(faces = db.len(), "system fonts loaded");
        Arc::new(db)
    }))
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// `fill` and `fill-opacity` attributes for a straight RGBA color.
fn fill_attrs(c: [u8; 4]) -> String {
    format!(
        "fill=\"rgb({},{},{})\" fill-opacity=\"{:.4}\"",
        c[0],
        c[1],
        c[2],
        f32::from(c[3]) / 255.0
    )
}

pub(crate) fn text_svg(text: &str, style: &TextStyle) -> String {
    let (w, h) = (style.width, style.height);
    let lines: Vec<&str> = text.lines().collect();
    let line_px = style.font_size * style.line_height;
    let block = line_px * lines.len().saturating_sub(1) as f32;
    let first_y = h as f32 / 2.0 - block / 2.0;
    let (x, anchor) = match style.align {
        TextAlign::Start => (0.0, "start"),
        TextAlign::Middle => (w as f32 / 2.0, "middle"),
        TextAlign::End => (w as f32, "end"),
    };

    let mut svg = format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{w}\" height=\"{h}\" viewBox=\"0 0 {w} {h}\">"
    );
    if let Some(bg) = style.background {
        svg.push_str(&format!(
            "<rect width=\"{w}\" height=\"{h}\" {}/>",
            fill_attrs(bg)
        ));
    }
    svg.push_str(&format!(
        "<text font-family=\"{}\" font-size=\"{}\" {} text-anchor=\"{anchor}\" dominant-baseline=\"central\">",
        escape_xml(&style.font_family),
        style.font_size,
        fill_attrs(style.color)
    ));
    for (i, line) in lines.iter().enumerate() {
        let y = first_y + line_px * i as f32;
        svg.push_str(&format!(
            "<tspan x=\"{x}\" y=\"{y}\">{}</tspan>",
            escape_xml(line)
        ));
    }
    svg.push_str("</text></svg>");
    svg
}

fn render_text(text: &str, style: &TextStyle) -> MontageResult<VideoFrame> {
    if style.width == 0 || style.height == 0 {
        return Err(MontageError::config("text clip dimensions must be non-zero"));
    }
    if !(style.font_size.is_finite() && style.font_size > 0.0) {
        return Err(MontageError::config("font size must be positive"));
    }
    let svg = text_svg(text, style);
    let opts = usvg::Options {
        fontdb: system_fontdb(),
        ..Default::default()
    };
    let tree = usvg::Tree::from_data(svg.as_bytes(), &opts).context("parse text svg")?;

    let mut pixmap = resvg::tiny_skia::Pixmap::new(style.width, style.height)
        .ok_or_else(|| MontageError::config("failed to allocate text pixmap"))?;
    resvg::render(&tree, resvg::tiny_skia::Transform::default(), &mut pixmap.as_mut());
    VideoFrame::new(0, UNBOUNDED, style.width, style.height, pixmap.data().to_vec())
}

#[cfg(test)]
#[path = "../../tests/unit/clip/text_clip.rs"]
mod tests;
