//! Timeline composition: clips placed in time and space, ticked on a virtual clock, composited,
//! mixed and handed to the remux engine.

pub mod combinator;
pub mod composite;
pub mod manifest;
pub mod mix;

use std::time::Duration;

use kurbo::Rect;

use crate::codec::{AudioEncoderConfig, VideoEncoderConfig};
use crate::foundation::core::{Fps, MICROS_PER_SEC, Rgba8Premul};
use crate::foundation::error::{MontageError, MontageResult};

pub use combinator::Combinator;
pub use composite::Canvas;
pub use manifest::{ClipSource, Manifest, ManifestEntry};
pub use mix::AudioMixer;

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub codec: String,
    pub bitrate: Option<u32>,
    pub quality: u8,
    /// A keyframe is forced every `gop_size` frames.
    pub gop_size: u32,
    /// Straight RGBA canvas background.
    pub bg_rgba: [u8; 4],
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            codec: crate::codec::jpeg::CODEC.to_owned(),
            bitrate: None,
            quality: 85,
            gop_size: 150,
            bg_rgba: [0, 0, 0, 255],
        }
    }
}

impl VideoSettings {
    pub fn background(&self) -> Rgba8Premul {
        let [r, g, b, a] = self.bg_rgba;
        Rgba8Premul::from_straight_rgba(r, g, b, a)
    }

    pub(crate) fn encoder_config(&self, fps: Fps) -> VideoEncoderConfig {
        VideoEncoderConfig {
            codec: self.codec.clone(),
            width: self.width,
            height: self.height,
            framerate: fps,
            bitrate: self.bitrate,
            quality: self.quality,
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: Option<u32>,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            codec: crate::codec::pcm::CODEC.to_owned(),
            sample_rate: 48_000,
            channels: 2,
            bitrate: None,
        }
    }
}

impl AudioSettings {
    pub(crate) fn encoder_config(&self) -> AudioEncoderConfig {
        AudioEncoderConfig {
            codec: self.codec.clone(),
            sample_rate: self.sample_rate,
            channels: self.channels,
            bitrate: self.bitrate,
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CombinatorOpts {
    pub fps: Fps,
    pub video: Option<VideoSettings>,
    pub audio: Option<AudioSettings>,
    /// Production pauses while more inputs than this wait in the encoders.
    pub max_encode_queue: usize,
    pub scheduler_interval_ms: u64,
    pub flush_interval_ms: u64,
    pub tags: Vec<(String, String)>,
    /// Microseconds; only used when there is no video track to cut fragments at keyframes.
    pub fragment_duration: i64,
}

impl Default for CombinatorOpts {
    fn default() -> Self {
        Self {
            fps: Fps::default(),
            video: Some(VideoSettings::default()),
            audio: Some(AudioSettings::default()),
            max_encode_queue: 50,
            scheduler_interval_ms: 15,
            flush_interval_ms: 100,
            tags: Vec::new(),
            fragment_duration: MICROS_PER_SEC,
        }
    }
}

impl CombinatorOpts {
    pub fn validate(&self) -> MontageResult<()> {
        self.fps.validate()?;
        if self.video.is_none() && self.audio.is_none() {
            return Err(MontageError::config(
                "composition needs video or audio output",
            ));
        }
        if let Some(v) = &self.video {
            if v.width == 0 || v.height == 0 {
                return Err(MontageError::config("video width/height must be non-zero"));
            }
            if v.gop_size == 0 {
                return Err(MontageError::config("gop_size must be at least 1"));
            }
        }
        if let Some(a) = &self.audio
            && (a.sample_rate == 0 || a.channels == 0)
        {
            return Err(MontageError::config(
                "audio sample rate and channel count must be non-zero",
            ));
        }
        if self.max_encode_queue == 0 {
            return Err(MontageError::config("max_encode_queue must be at least 1"));
        }
        if self.scheduler_interval_ms == 0 || self.flush_interval_ms == 0 {
            return Err(MontageError::config("scheduler intervals must be non-zero"));
        }
        if self.fragment_duration <= 0 {
            return Err(MontageError::config("fragment_duration must be positive"));
        }
        Ok(())
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_interval_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Where and when a clip plays.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Placement {
    /// Timeline start in microseconds.
    pub offset: i64,
    /// Defaults to the clip's own duration; required for unbounded clips.
    pub duration: Option<i64>,
    /// Canvas area in pixels; defaults to the full canvas.
    pub rect: Option<Rect>,
    pub volume: f32,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            offset: 0,
            duration: None,
            rect: None,
            volume: 1.0,
        }
    }
}

impl Placement {
    pub fn at(offset: i64) -> Self {
        Self {
            offset,
            ..Self::default()
        }
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_rect(mut self, rect: Rect) -> Self {
        self.rect = Some(rect);
        self
    }

    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }
}

#[cfg(test)]
#[path = "../../tests/unit/timeline/mod.rs"]
mod tests;
