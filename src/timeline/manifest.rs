use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use bytes::Bytes;

use crate::clip::{
    AudioClip, AudioClipOptions, Clip, ImageClip, Mp4Clip, Mp4ClipOptions, TextClip, TextStyle,
};
use crate::codec::CodecFactory;
use crate::foundation::error::MontageResult;
use crate::timeline::{Combinator, CombinatorOpts, Placement};

/// JSON description of a whole composition.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub options: CombinatorOpts,
    pub entries: Vec<ManifestEntry>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ManifestEntry {
    #[serde(flatten)]
    pub source: ClipSource,
    #[serde(default)]
    pub placement: Placement,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClipSource {
    Mp4 {
        path: PathBuf,
        #[serde(default)]
        options: Mp4ClipOptions,
    },
    Image {
        path: PathBuf,
    },
    Audio {
        path: PathBuf,
        #[serde(default)]
        options: AudioClipOptions,
    },
    Text {
        text: String,
        #[serde(default)]
        style: TextStyle,
    },
}

impl Manifest {
    pub fn from_json(json: &str) -> MontageResult<Self> {
        Ok(serde_json::from_str(json).context("parse manifest json")?)
    }

    /// Opens every clip (paths relative to `base_dir`) and places it on a new timeline.
    pub async fn build(
        &self,
        base_dir: &Path,
        codecs: Arc<dyn CodecFactory>,
    ) -> MontageResult<Combinator> {
        let mut combinator = Combinator::new(self.options.clone(), Arc::clone(&codecs))?;
        for entry in &self.entries {
            let clip = entry.source.open(base_dir, Arc::clone(&codecs))?;
            combinator.add(clip, entry.placement).await?;
        }
        Ok(combinator)
    }
}

impl ClipSource {
    pub fn open(
        &self,
        base_dir: &Path,
        codecs: Arc<dyn CodecFactory>,
    ) -> MontageResult<Box<dyn Clip>> {
        let read = |path: &Path| -> MontageResult<Vec<u8>> {
            let full = base_dir.join(path);
            Ok(std::fs::read(&full).with_context(|| format!("read '{}'", full.display()))?)
        };
        let clip: Box<dyn Clip> = match self {
            Self::Mp4 { path, options } => Box::new(Mp4Clip::from_bytes(
                Bytes::from(read(path)?),
                codecs,
                *options,
            )),
            Self::Image { path } => Box::new(ImageClip::from_bytes(&read(path)?)?),
            Self::Audio { path, options } => Box::new(AudioClip::from_wav(&read(path)?, *options)?),
            Self::Text { text, style } => Box::new(TextClip::new(text, style)?),
        };
        Ok(clip)
    }
}

#[cfg(test)]
#[path = "../../tests/unit/timeline/manifest.rs"]
mod tests;
