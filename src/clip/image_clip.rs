use std::io::Cursor;

use anyhow::Context as _;
use futures::future::{self, BoxFuture};
use image::AnimationDecoder as _;
use image::codecs::gif::GifDecoder;

use crate::clip::{AudioPayloads, Clip, ClipMeta, ClipTick, TickCursor};
use crate::foundation::core::UNBOUNDED;
use crate::foundation::error::{MontageError, MontageResult};
use crate::foundation::math::premultiply_rgba8_in_place;
use crate::media::frame::VideoFrame;

/// GIF frames with a zero delay play at this rate, like browsers do.
const DEFAULT_GIF_DELAY_US: i64 = 100_000;

/// A constant picture, or an animated GIF that loops forever.
///
/// Time never exhausts an image; only [`Clip::destroy`] ends it.
pub struct ImageClip {
    /// Frames with timestamps relative to the start of one animation cycle.
    frames: Vec<VideoFrame>,
    /// Length of one animation cycle; `None` for a still image.
    cycle: Option<i64>,
    meta: ClipMeta,
    cursor: TickCursor,
}

impl ImageClip {
    /// Decodes any format the `image` crate understands. Animated GIFs keep every frame.
    pub fn from_bytes(bytes: &[u8]) -> MontageResult<Self> {
        let format = image::guess_format(bytes).context("detect image format")?;
        if format == image::ImageFormat::Gif {
            return Self::from_gif(bytes);
        }
        let rgba = image::load_from_memory(bytes)
            .context("decode image from memory")?
            .to_rgba8();
        let (width, height) = rgba.dimensions();
        let mut data = rgba.into_raw();
        premultiply_rgba8_in_place(&mut data);
        Self::from_frame(VideoFrame::new(0, UNBOUNDED, width, height, data)?)
    }

    pub fn from_frame(frame: VideoFrame) -> MontageResult<Self> {
        let meta = ClipMeta {
            duration: UNBOUNDED,
            width: frame.width,
            height: frame.height,
            audio: None,
        };
        Ok(Self {
            frames: vec![frame.with_timing(0, UNBOUNDED)],
            cycle: None,
            meta,
            cursor: TickCursor::default(),
        })
    }

    fn from_gif(bytes: &[u8]) -> MontageResult<Self> {
        let decoder = GifDecoder::new(Cursor::new(bytes)).context("open gif")?;
        let decoded = decoder
            .into_frames()
            .collect_frames()
            .context("decode gif frames")?;
        if decoded.is_empty() {
            return Err(MontageError::config("gif contains no frames"));
        }

        let mut frames = Vec::with_capacity(decoded.len());
        let mut t = 0i64;
        for frame in decoded {
            let (num, den) = frame.delay().numer_denom_ms();
            let mut delay = if den == 0 {
                0
            } else {
                i64::from(num) * 1000 / i64::from(den)
            };
            if delay <= 0 {
                delay = DEFAULT_GIF_DELAY_US;
            }
            let rgba = frame.into_buffer();
            let (width, height) = rgba.dimensions();
            let mut data = rgba.into_raw();
            premultiply_rgba8_in_place(&mut data);
            frames.push(VideoFrame::new(t, delay, width, height, data)?);
            t += delay;
        }

        if frames.len() == 1 {
            let still = frames.remove(0);
            return Self::from_frame(still);
        }
        let meta = ClipMeta {
            duration: t,
            width: frames[0].width,
            height: frames[0].height,
            audio: None,
        };
        tracing::debug!(frames = frames.len(), cycle_us = t, "animated gif decoded");
        Ok(Self {
            frames,
            cycle: Some(t),
            meta,
            cursor: TickCursor::default(),
        })
    }

    fn frame_at(&self, time: i64) -> Option<VideoFrame> {
        let Some(cycle) = self.cycle else {
            return self.frames.first().cloned();
        };
        let local = time.rem_euclid(cycle);
        let base = time - local;
        self.frames
            .iter()
            .find(|f| f.contains(local))
            .map(|f| f.with_timing(base + f.timestamp, f.duration))
    }
}

impl Clip for ImageClip {
    fn ready(&mut self) -> BoxFuture<'_, MontageResult<ClipMeta>> {
        Box::pin(future::ready(Ok(self.meta)))
    }

    fn tick(&mut self, time: i64) -> BoxFuture<'_, MontageResult<ClipTick>> {
        let result = self.cursor.advance(time).map(|()| {
            if self.cursor.is_done() {
                return ClipTick::done(AudioPayloads::new());
            }
            match self.frame_at(time) {
                Some(frame) => ClipTick::success(Some(frame), AudioPayloads::new()),
                None => ClipTick::next(AudioPayloads::new()),
            }
        });
        Box::pin(future::ready(result))
    }

    fn destroy(&mut self) {
        self.frames.clear();
        self.cursor.finish();
    }
}

#[cfg(test)]
#[path = "../../tests/unit/clip/image_clip.rs"]
mod tests;
