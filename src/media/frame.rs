use std::sync::Arc;

use crate::foundation::core::{Rgba8Premul, samples_in_span};
use crate::foundation::error::{MontageError, MontageResult};

/// A decoded or composited picture in premultiplied RGBA8.
///
/// Pixel storage is shared read-only data: cloning a frame is cheap and the buffer is released
/// when the last clone drops.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoFrame {
    pub timestamp: i64,
    pub duration: i64,
    pub width: u32,
    pub height: u32,
    pub data: Arc<Vec<u8>>,
}

impl VideoFrame {
    pub fn new(
        timestamp: i64,
        duration: i64,
        width: u32,
        height: u32,
        data: Vec<u8>,
    ) -> MontageResult<Self> {
        if width == 0 || height == 0 {
            return Err(MontageError::config("video frame dimensions must be non-zero"));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(4))
            .ok_or_else(|| MontageError::config("video frame size overflow"))?;
        if data.len() != expected {
            return Err(MontageError::config(format!(
                "video frame buffer is {} bytes, expected {expected} for {width}x{height}",
                data.len()
            )));
        }
        Ok(Self {
            timestamp,
            duration,
            width,
            height,
            data: Arc::new(data),
        })
    }

    pub fn solid(width: u32, height: u32, color: Rgba8Premul) -> MontageResult<Self> {
        let px = color.to_array();
        let mut data = Vec::with_capacity(width as usize * height as usize * 4);
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&px);
        }
        Self::new(0, 0, width, height, data)
    }

    /// Same pixels, new timing.
    pub fn with_timing(&self, timestamp: i64, duration: i64) -> Self {
        Self {
            timestamp,
            duration,
            width: self.width,
            height: self.height,
            data: Arc::clone(&self.data),
        }
    }

    /// End of the validity interval `[timestamp, timestamp + duration)`.
    pub fn end(&self) -> i64 {
        self.timestamp.saturating_add(self.duration)
    }

    pub fn contains(&self, time: i64) -> bool {
        self.timestamp <= time && time < self.end()
    }
}

/// Interleaved `f32` PCM payload.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioData {
    pub timestamp: i64,
    pub duration: i64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioData {
    pub fn new(
        timestamp: i64,
        sample_rate: u32,
        channels: u16,
        samples: Vec<f32>,
    ) -> MontageResult<Self> {
        if sample_rate == 0 || channels == 0 {
            return Err(MontageError::config(
                "audio sample rate and channel count must be non-zero",
            ));
        }
        if !samples.len().is_multiple_of(usize::from(channels)) {
            return Err(MontageError::config(format!(
                "audio buffer of {} samples is not a multiple of {channels} channels",
                samples.len()
            )));
        }
        let frames = (samples.len() / usize::from(channels)) as u64;
        let duration = crate::foundation::core::sample_to_time(frames, sample_rate);
        Ok(Self {
            timestamp,
            duration,
            sample_rate,
            channels,
            samples,
        })
    }

    /// Silence covering `[timestamp, timestamp + duration)` with the exact telescoping frame count.
    pub fn silence(timestamp: i64, duration: i64, sample_rate: u32, channels: u16) -> Self {
        let frames = samples_in_span(timestamp, timestamp + duration, sample_rate) as usize;
        Self {
            timestamp,
            duration,
            sample_rate,
            channels,
            samples: vec![0.0; frames * usize::from(channels)],
        }
    }

    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / usize::from(self.channels)
    }
}

#[cfg(test)]
#[path = "../../tests/unit/media/frame.rs"]
mod tests;
