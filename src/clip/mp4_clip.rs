use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt as _;
use futures::future::BoxFuture;
use tokio::io::AsyncRead;

use crate::clip::{AudioInfo, AudioPayloads, Clip, ClipMeta, ClipTick, TickCursor};
use crate::codec::{CodecFactory, DecoderEvent};
use crate::demux::source::{FrameSource, SourceOptions, SourceReady};
use crate::foundation::error::{MontageError, MontageResult};
use crate::media::chunk::{MediaKind, TrackConfig};
use crate::media::frame::{AudioData, VideoFrame};

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Mp4ClipOptions {
    pub decode_audio: bool,
    /// Decoded video frames buffered ahead of the playhead before the reader pauses.
    pub max_buffered_frames: usize,
}

impl Default for Mp4ClipOptions {
    fn default() -> Self {
        Self {
            decode_audio: true,
            max_buffered_frames: 30,
        }
    }
}

/// A clip decoded from an MP4 byte stream in the background.
pub struct Mp4Clip {
    source: Option<FrameSource>,
    meta: Option<ClipMeta>,
    has_video: bool,
    has_audio: bool,
    decoders: usize,
    flushed: usize,
    ended: bool,
    audio_flushed: bool,
    /// End of the decoded audio received so far.
    audio_until: i64,
    /// Audio never reaches past this point, so waiting for more is pointless.
    audio_limit: i64,
    frames: VecDeque<VideoFrame>,
    audio: VecDeque<AudioData>,
    cursor: TickCursor,
}

impl Mp4Clip {
    /// Starts demuxing `reader` on the current tokio runtime.
    pub fn new<R>(reader: R, codecs: Arc<dyn CodecFactory>, opts: Mp4ClipOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let source = FrameSource::spawn(
            reader,
            codecs,
            SourceOptions {
                decode_audio: opts.decode_audio,
                max_buffered_frames: opts.max_buffered_frames.max(1),
                ..SourceOptions::default()
            },
        );
        Self {
            source: Some(source),
            meta: None,
            has_video: false,
            has_audio: false,
            decoders: 0,
            flushed: 0,
            ended: false,
            audio_flushed: false,
            audio_until: 0,
            audio_limit: i64::MAX,
            frames: VecDeque::new(),
            audio: VecDeque::new(),
            cursor: TickCursor::default(),
        }
    }

    pub fn from_bytes(bytes: Bytes, codecs: Arc<dyn CodecFactory>, opts: Mp4ClipOptions) -> Self {
        Self::new(std::io::Cursor::new(bytes), codecs, opts)
    }

    fn store(&mut self, event: Option<DecoderEvent>) -> MontageResult<()> {
        match event {
            Some(DecoderEvent::Video(frame)) => self.frames.push_back(frame),
            Some(DecoderEvent::Audio(data)) => {
                self.audio_until = self
                    .audio_until
                    .max(data.timestamp.saturating_add(data.duration));
                self.audio.push_back(data);
            }
            Some(DecoderEvent::Flushed(kind)) => {
                if kind == MediaKind::Audio {
                    self.audio_flushed = true;
                }
                self.flushed += 1;
                if self.flushed >= self.decoders {
                    self.ended = true;
                }
            }
            Some(DecoderEvent::Error(e)) => return Err(e),
            None => self.ended = true,
        }
        Ok(())
    }

    /// Waits for the next decoder event.
    async fn pull(&mut self) -> MontageResult<()> {
        let event = match &mut self.source {
            Some(source) if !self.ended => source.events.recv().await,
            _ => None,
        };
        self.store(event)
    }

    /// Takes every event that is already available.
    fn drain_available(&mut self) -> MontageResult<()> {
        while !self.ended {
            let Some(source) = &mut self.source else {
                self.ended = true;
                break;
            };
            match source.events.try_recv() {
                Ok(event) => self.store(Some(event))?,
                Err(tokio::sync::mpsc::error::TryRecvError::Empty) => break,
                Err(tokio::sync::mpsc::error::TryRecvError::Disconnected) => self.store(None)?,
            }
        }
        Ok(())
    }

    fn pop_frame(&mut self) {
        if self.frames.pop_front().is_some()
            && let Some(source) = &self.source
        {
            source.frame_consumed();
        }
    }

    /// Pulls events until the decoded audio reaches `time`. Audio stored after a run of video in
    /// the file is only reached by reading past the buffered frame limit.
    async fn wait_for_audio(&mut self, time: i64) -> MontageResult<()> {
        let target = time.min(self.audio_limit);
        let covered = |clip: &Self| clip.ended || clip.audio_flushed || clip.audio_until >= target;
        if !self.has_audio || covered(self) {
            return Ok(());
        }
        let Some(source) = &self.source else {
            return Ok(());
        };
        source.set_unthrottled(true);
        tracing::trace!(time, audio_until = self.audio_until, "waiting for audio");
        let mut result = Ok(());
        while !covered(self) {
            if let Err(e) = self.pull().await {
                result = Err(e);
                break;
            }
        }
        if let Some(source) = &self.source {
            source.set_unthrottled(false);
        }
        result
    }

    fn take_audio_until(&mut self, time: i64) -> AudioPayloads {
        let mut out = AudioPayloads::new();
        while self.audio.front().is_some_and(|a| a.timestamp <= time) {
            if let Some(a) = self.audio.pop_front() {
                out.push(a);
            }
        }
        out
    }

    async fn finish_stream(&mut self) -> MontageResult<AudioPayloads> {
        while !self.ended {
            while !self.frames.is_empty() {
                self.pop_frame();
            }
            self.pull().await?;
        }
        while !self.frames.is_empty() {
            self.pop_frame();
        }
        self.cursor.finish();
        Ok(self.audio.drain(..).collect())
    }

    async fn ready_inner(&mut self) -> MontageResult<ClipMeta> {
        if let Some(meta) = self.meta {
            return Ok(meta);
        }
        let Some(source) = &mut self.source else {
            return Err(MontageError::Cancelled);
        };
        let SourceReady {
            movie,
            video,
            audio,
        } = source.ready().await?;
        self.decoders = usize::from(video.is_some()) + usize::from(audio.is_some());
        self.has_video = video.is_some();
        self.has_audio = audio.is_some();
        // Sample times are floored to whole microseconds; the last payload may end 1 us short.
        self.audio_limit = match audio.as_ref().map(|t| t.duration) {
            Some(d) if d > 0 => d - 1,
            _ => i64::MAX,
        };

        loop {
            let produced = if self.has_video {
                !self.frames.is_empty()
            } else {
                !self.audio.is_empty()
            };
            if produced {
                break;
            }
            if self.ended {
                return Err(MontageError::config(
                    "mp4 source ended before producing a single frame",
                ));
            }
            self.pull().await?;
        }

        let (width, height) = match video.as_ref().map(|t| &t.config) {
            Some(TrackConfig::Video(v)) => (v.width, v.height),
            _ => (0, 0),
        };
        let audio_info = match audio.as_ref().map(|t| &t.config) {
            Some(TrackConfig::Audio(a)) => Some(AudioInfo {
                sample_rate: a.sample_rate,
                channels: a.channels,
            }),
            _ => None,
        };
        let mut duration = movie.duration;
        if duration <= 0 {
            duration = movie.tracks.iter().map(|t| t.duration).max().unwrap_or(0);
        }
        let meta = ClipMeta {
            duration,
            width,
            height,
            audio: audio_info,
        };
        tracing::debug!(?meta, fragmented = movie.fragmented, "mp4 clip ready");
        self.meta = Some(meta);
        Ok(meta)
    }

    async fn tick_inner(&mut self, time: i64) -> MontageResult<ClipTick> {
        self.cursor.advance(time)?;
        if self.cursor.is_done() {
            return Ok(ClipTick::done(AudioPayloads::new()));
        }
        let meta = self.ready_inner().await?;
        self.drain_available()?;

        if time >= meta.duration {
            let audio = self.finish_stream().await?;
            return Ok(ClipTick::done(audio));
        }

        if !self.has_video {
            while !self.ended && self.audio.back().is_none_or(|a| a.timestamp <= time) {
                self.pull().await?;
            }
            if self.ended && self.audio.is_empty() {
                self.cursor.finish();
                return Ok(ClipTick::done(AudioPayloads::new()));
            }
            return Ok(ClipTick::success(None, self.take_audio_until(time)));
        }

        loop {
            while self.frames.front().is_some_and(|f| f.end() <= time) {
                self.pop_frame();
            }
            if !self.frames.is_empty() {
                break;
            }
            if self.ended {
                let audio = self.finish_stream().await?;
                return Ok(ClipTick::done(audio));
            }
            self.pull().await?;
        }

        self.wait_for_audio(time).await?;
        let frame = match self.frames.front() {
            Some(front) if front.timestamp <= time => Some(front.clone()),
            _ => None,
        };
        let audio = self.take_audio_until(time);
        Ok(match frame {
            Some(frame) => ClipTick::success(Some(frame), audio),
            None => ClipTick::next(audio),
        })
    }
}

impl Clip for Mp4Clip {
    fn ready(&mut self) -> BoxFuture<'_, MontageResult<ClipMeta>> {
        self.ready_inner().boxed()
    }

    fn tick(&mut self, time: i64) -> BoxFuture<'_, MontageResult<ClipTick>> {
        self.tick_inner(time).boxed()
    }

    fn destroy(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.cancel();
        }
        self.frames.clear();
        self.audio.clear();
        self.ended = true;
        self.cursor.finish();
    }
}

#[cfg(test)]
#[path = "../../tests/unit/clip/mp4_clip.rs"]
mod tests;
