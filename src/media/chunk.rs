use bytes::Bytes;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Key,
    Delta,
}

/// One coded access unit produced by an encoder or read from a container.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedChunk {
    pub kind: ChunkKind,
    pub timestamp: i64,
    pub duration: i64,
    pub data: Bytes,
}

impl EncodedChunk {
    pub fn is_key(&self) -> bool {
        self.kind == ChunkKind::Key
    }

    pub fn end(&self) -> i64 {
        self.timestamp.saturating_add(self.duration)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoTrackConfig {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    /// Codec-specific decoder configuration (`avcC` payload, MPEG-4 decoder specific info, ...).
    pub description: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioTrackConfig {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub description: Bytes,
}

/// Decoder configuration attached to the first output of an encoder. One track is created per
/// media kind from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackConfig {
    Video(VideoTrackConfig),
    Audio(AudioTrackConfig),
}

impl TrackConfig {
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Video(_) => MediaKind::Video,
            Self::Audio(_) => MediaKind::Audio,
        }
    }

    pub fn codec(&self) -> &str {
        match self {
            Self::Video(v) => &v.codec,
            Self::Audio(a) => &a.codec,
        }
    }
}
