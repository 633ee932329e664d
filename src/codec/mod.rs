//! Encoder/decoder contracts and the software reference codecs.
//!
//! Codecs are asynchronous: inputs are queued onto a dedicated worker thread and every output is
//! delivered as an event on a tokio unbounded channel supplied at creation. The first chunk an
//! encoder emits carries the [`TrackConfig`] describing its output.

pub mod jpeg;
pub mod pcm;
pub(crate) mod worker;

use tokio::sync::mpsc::UnboundedSender;

use crate::foundation::core::Fps;
use crate::foundation::error::{CodecDiagnostics, CodecState, MontageError, MontageResult};
use crate::media::chunk::{
    AudioTrackConfig, EncodedChunk, MediaKind, TrackConfig, VideoTrackConfig,
};
use crate::media::frame::{AudioData, VideoFrame};

pub use jpeg::{JpegDecoder, JpegEncoder};
pub use pcm::{PcmDecoder, PcmEncoder};

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VideoEncoderConfig {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub framerate: Fps,
    pub bitrate: Option<u32>,
    /// 1..=100, used by quality-driven codecs.
    pub quality: u8,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AudioEncoderConfig {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: Option<u32>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncodeOptions {
    pub key_frame: bool,
}

#[derive(Debug)]
pub enum EncoderEvent {
    Chunk {
        chunk: EncodedChunk,
        config: Option<TrackConfig>,
    },
    /// Every input submitted before the matching `flush()` has been emitted.
    Flushed,
    Error(MontageError),
}

#[derive(Debug)]
pub enum DecoderEvent {
    Video(VideoFrame),
    Audio(AudioData),
    /// The decoder of this kind emitted everything submitted before its `flush()`.
    Flushed(MediaKind),
    Error(MontageError),
}

pub trait VideoEncoder: Send {
    fn configure(&mut self, config: &VideoEncoderConfig) -> MontageResult<()>;
    fn encode(&mut self, frame: VideoFrame, opts: EncodeOptions) -> MontageResult<()>;
    fn flush(&mut self) -> MontageResult<()>;
    fn queue_size(&self) -> usize;
    fn state(&self) -> CodecState;
    fn close(&mut self);
}

pub trait AudioEncoder: Send {
    fn configure(&mut self, config: &AudioEncoderConfig) -> MontageResult<()>;
    fn encode(&mut self, data: AudioData) -> MontageResult<()>;
    fn flush(&mut self) -> MontageResult<()>;
    fn queue_size(&self) -> usize;
    fn state(&self) -> CodecState;
    fn close(&mut self);
}

pub trait VideoDecoder: Send {
    fn configure(&mut self, config: &VideoTrackConfig) -> MontageResult<()>;
    fn decode(&mut self, chunk: EncodedChunk) -> MontageResult<()>;
    fn flush(&mut self) -> MontageResult<()>;
    fn queue_size(&self) -> usize;
    fn state(&self) -> CodecState;
    fn close(&mut self);
}

pub trait AudioDecoder: Send {
    fn configure(&mut self, config: &AudioTrackConfig) -> MontageResult<()>;
    fn decode(&mut self, chunk: EncodedChunk) -> MontageResult<()>;
    fn flush(&mut self) -> MontageResult<()>;
    fn queue_size(&self) -> usize;
    fn state(&self) -> CodecState;
    fn close(&mut self);
}

/// Host-provided codec registry. Creation fails with a configuration error for unknown codecs.
pub trait CodecFactory: Send + Sync {
    fn video_encoder(
        &self,
        codec: &str,
        events: UnboundedSender<EncoderEvent>,
    ) -> MontageResult<Box<dyn VideoEncoder>>;

    fn audio_encoder(
        &self,
        codec: &str,
        events: UnboundedSender<EncoderEvent>,
    ) -> MontageResult<Box<dyn AudioEncoder>>;

    fn video_decoder(
        &self,
        codec: &str,
        events: UnboundedSender<DecoderEvent>,
    ) -> MontageResult<Box<dyn VideoDecoder>>;

    fn audio_decoder(
        &self,
        codec: &str,
        events: UnboundedSender<DecoderEvent>,
    ) -> MontageResult<Box<dyn AudioDecoder>>;
}

/// Pure-Rust codecs: `jpeg` pictures and `pcm-s16` audio.
#[derive(Clone, Copy, Debug, Default)]
pub struct SoftwareCodecs;

impl CodecFactory for SoftwareCodecs {
    fn video_encoder(
        &self,
        codec: &str,
        events: UnboundedSender<EncoderEvent>,
    ) -> MontageResult<Box<dyn VideoEncoder>> {
        match codec {
            jpeg::CODEC => Ok(Box::new(JpegEncoder::new(events))),
            other => Err(MontageError::config(format!(
                "unsupported video encoder codec '{other}'"
            ))),
        }
    }

    fn audio_encoder(
        &self,
        codec: &str,
        events: UnboundedSender<EncoderEvent>,
    ) -> MontageResult<Box<dyn AudioEncoder>> {
        match codec {
            pcm::CODEC => Ok(Box::new(PcmEncoder::new(events))),
            other => Err(MontageError::config(format!(
                "unsupported audio encoder codec '{other}'"
            ))),
        }
    }

    fn video_decoder(
        &self,
        codec: &str,
        events: UnboundedSender<DecoderEvent>,
    ) -> MontageResult<Box<dyn VideoDecoder>> {
        match codec {
            jpeg::CODEC => Ok(Box::new(JpegDecoder::new(events))),
            other => Err(MontageError::config(format!(
                "no decoder available for video codec '{other}'"
            ))),
        }
    }

    fn audio_decoder(
        &self,
        codec: &str,
        events: UnboundedSender<DecoderEvent>,
    ) -> MontageResult<Box<dyn AudioDecoder>> {
        match codec {
            pcm::CODEC => Ok(Box::new(PcmDecoder::new(events))),
            other => Err(MontageError::config(format!(
                "no decoder available for audio codec '{other}'"
            ))),
        }
    }
}

pub(crate) fn diagnostics(
    codec: &str,
    state: CodecState,
    queue_size: usize,
    timestamp: Option<i64>,
) -> CodecDiagnostics {
    CodecDiagnostics {
        codec: codec.to_owned(),
        state,
        queue_size,
        timestamp,
    }
}

#[cfg(test)]
#[path = "../../tests/unit/codec/mod.rs"]
mod tests;
