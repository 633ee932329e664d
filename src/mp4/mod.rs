//! ISO base media file format: box model, parser and fragmented muxer.

use bytes::Bytes;

pub mod boxes;
pub mod muxer;
pub mod reader;

pub use muxer::{MuxerOptions, MuxerStats, Mp4Muxer, TrackSet};
pub use reader::{MovieInfo, TrackInfo};

/// One coded sample with times in microseconds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    pub dts: i64,
    pub cts: i64,
    pub duration: i64,
    pub is_sync: bool,
    pub data: Bytes,
}

impl Sample {
    pub fn from_chunk(chunk: &crate::media::chunk::EncodedChunk) -> Self {
        Self {
            dts: chunk.timestamp,
            cts: chunk.timestamp,
            duration: chunk.duration,
            is_sync: chunk.is_key(),
            data: chunk.data.clone(),
        }
    }
}
