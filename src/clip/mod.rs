//! Pull-based media producers.
//!
//! A clip becomes ready asynchronously, then serves `tick(time)` with non-decreasing local times
//! until it reports [`ClipState::Done`]. Video frames that fall behind the requested time are
//! dropped; audio is never dropped.

use futures::future::BoxFuture;
use smallvec::SmallVec;

use crate::foundation::error::{MontageError, MontageResult};
use crate::media::frame::{AudioData, VideoFrame};

pub mod audio_clip;
pub mod image_clip;
pub mod mp4_clip;
pub mod text_clip;

pub use audio_clip::{AudioClip, AudioClipOptions};
pub use image_clip::ImageClip;
pub use mp4_clip::{Mp4Clip, Mp4ClipOptions};
pub use text_clip::{TextClip, TextStyle};

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClipMeta {
    /// Microseconds; [`crate::UNBOUNDED`] for clips without a natural end.
    pub duration: i64,
    /// Zero for audio-only clips.
    pub width: u32,
    pub height: u32,
    pub audio: Option<AudioInfo>,
}

impl ClipMeta {
    pub fn has_video(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClipState {
    /// A frame covering the requested time was returned.
    Success,
    /// The next frame lies in the future; retry with a later time.
    Next,
    /// Exhausted. Every later tick returns `Done` again.
    Done,
}

pub type AudioPayloads = SmallVec<[AudioData; 2]>;

#[derive(Clone, Debug)]
pub struct ClipTick {
    pub video: Option<VideoFrame>,
    pub audio: AudioPayloads,
    pub state: ClipState,
}

impl ClipTick {
    pub fn success(video: Option<VideoFrame>, audio: AudioPayloads) -> Self {
        Self {
            video,
            audio,
            state: ClipState::Success,
        }
    }

    pub fn next(audio: AudioPayloads) -> Self {
        Self {
            video: None,
            audio,
            state: ClipState::Next,
        }
    }

    pub fn done(audio: AudioPayloads) -> Self {
        Self {
            video: None,
            audio,
            state: ClipState::Done,
        }
    }
}

pub trait Clip: Send {
    /// Resolves once the clip can serve ticks. The result is cached.
    fn ready(&mut self) -> BoxFuture<'_, MontageResult<ClipMeta>>;

    /// Produces the payloads for local time `time` (microseconds since the clip start).
    fn tick(&mut self, time: i64) -> BoxFuture<'_, MontageResult<ClipTick>>;

    /// Releases buffered frames and background work. Later ticks return `Done`.
    fn destroy(&mut self);
}

/// Shared tick bookkeeping: rollback detection and the sticky terminal state.
#[derive(Debug, Default)]
pub(crate) struct TickCursor {
    last: Option<i64>,
    done: bool,
}

impl TickCursor {
    pub(crate) fn advance(&mut self, time: i64) -> MontageResult<()> {
        if let Some(last) = self.last
            && time < last
        {
            return Err(MontageError::sequence(format!(
                "tick rollback: requested {time}us after {last}us"
            )));
        }
        self.last = Some(time);
        Ok(())
    }

    /// Time of the previous tick, if any.
    pub(crate) fn last(&self) -> Option<i64> {
        self.last
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn finish(&mut self) {
        self.done = true;
    }
}

#[cfg(test)]
#[path = "../../tests/unit/clip/mod.rs"]
mod tests;
