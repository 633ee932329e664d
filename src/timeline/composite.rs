use kurbo::Rect;
use rayon::prelude::*;

use crate::foundation::core::Rgba8Premul;
use crate::foundation::error::MontageResult;
use crate::foundation::math::{add_sat_u8, mul_div255_u8};
use crate::media::frame::VideoFrame;

pub type PremulRgba8 = [u8; 4];

/// Source-over for premultiplied pixels.
pub fn over(dst: PremulRgba8, src: PremulRgba8) -> PremulRgba8 {
    match src[3] {
        255 => src,
        0 => dst,
        a => {
            let inv = 255u16 - u16::from(a);
            let mut out = [0u8; 4];
            for i in 0..4 {
                out[i] = add_sat_u8(src[i], mul_div255_u8(u16::from(dst[i]), inv));
            }
            out
        }
    }
}

/// Output frame buffer owned by the tick loop.
pub struct Canvas {
    width: u32,
    height: u32,
    background: PremulRgba8,
    data: Vec<u8>,
}

impl Canvas {
    pub fn new(width: u32, height: u32, background: Rgba8Premul) -> Self {
        let background = background.to_array();
        let data = background.repeat(width as usize * height as usize);
        Self {
            width,
            height,
            background,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn full_rect(&self) -> Rect {
        Rect::new(0.0, 0.0, f64::from(self.width), f64::from(self.height))
    }

    pub fn clear(&mut self) {
        let bg = self.background;
        for px in self.data.chunks_exact_mut(4) {
            px.copy_from_slice(&bg);
        }
    }

    /// Scales `frame` into `rect` (nearest neighbour) and composites it over the canvas.
    pub fn draw(&mut self, frame: &VideoFrame, rect: Rect) {
        let rect = rect.abs();
        if rect.width() <= 0.0 || rect.height() <= 0.0 {
            return;
        }
        let x0 = rect.x0.round().max(0.0) as i64;
        let y0 = rect.y0.round().max(0.0) as i64;
        let x1 = (rect.x1.round() as i64).min(i64::from(self.width));
        let y1 = (rect.y1.round() as i64).min(i64::from(self.height));
        if x0 >= x1 || y0 >= y1 {
            return;
        }

        let (src_w, src_h) = (frame.width as usize, frame.height as usize);
        let sx = src_w as f64 / rect.width();
        let sy = src_h as f64 / rect.height();
        let src = frame.data.as_slice();
        let stride = self.width as usize * 4;

        self.data
            .par_chunks_exact_mut(stride)
            .enumerate()
            .skip(y0 as usize)
            .take((y1 - y0) as usize)
            .for_each(|(y, row)| {
                let v = ((y as f64 + 0.5 - rect.y0) * sy).floor();
                let v = (v.max(0.0) as usize).min(src_h - 1);
                let src_row = &src[v * src_w * 4..(v + 1) * src_w * 4];
                for x in x0 as usize..x1 as usize {
                    let u = ((x as f64 + 0.5 - rect.x0) * sx).floor();
                    let u = (u.max(0.0) as usize).min(src_w - 1);
                    let s = &src_row[u * 4..u * 4 + 4];
                    let d = &mut row[x * 4..x * 4 + 4];
                    let out = over([d[0], d[1], d[2], d[3]], [s[0], s[1], s[2], s[3]]);
                    d.copy_from_slice(&out);
                }
            });
    }

    /// Copies the current pixels into a frame; the canvas keeps its contents.
    pub fn snapshot(&self, timestamp: i64, duration: i64) -> MontageResult<VideoFrame> {
        VideoFrame::new(timestamp, duration, self.width, self.height, self.data.clone())
    }
}

#[cfg(test)]
#[path = "../../tests/unit/timeline/composite.rs"]
mod tests;
