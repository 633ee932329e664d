#![forbid(unsafe_code)]
//! Timeline-driven audio/video composition with incremental fragmented MP4 output.
//!
//! Clips ([`clip`]) are placed on a [`Combinator`] timeline, ticked on a virtual clock,
//! composited and mixed, then encoded and remuxed ([`remux`]) into a [`ByteStream`] of `ftyp`,
//! `moov` and `moof`/`mdat` boxes. MP4 input is demuxed incrementally ([`demux`]) and decoded
//! through a pluggable [`CodecFactory`].

pub mod clip;
pub mod codec;
pub mod demux;
pub mod foundation;
pub mod media;
pub mod mp4;
pub mod remux;
pub mod stream;
pub mod timeline;

pub use clip::{
    AudioClip, AudioClipOptions, Clip, ClipMeta, ClipState, ClipTick, ImageClip, Mp4Clip,
    Mp4ClipOptions, TextClip, TextStyle,
};
pub use codec::{CodecFactory, SoftwareCodecs};
pub use demux::{DemuxEvent, Demuxer};
pub use foundation::core::{Fps, MICROS_PER_SEC, Rect, Rgba8Premul, UNBOUNDED};
pub use foundation::error::{CodecDiagnostics, CodecState, MontageError, MontageResult};
pub use foundation::signal::OnceSignal;
pub use media::chunk::{EncodedChunk, MediaKind, TrackConfig};
pub use media::frame::{AudioData, VideoFrame};
pub use remux::{RemuxEngine, RemuxOptions};
pub use stream::{ByteStream, Supervisor, TickScheduler};
pub use timeline::{AudioSettings, Combinator, CombinatorOpts, Placement, VideoSettings};
