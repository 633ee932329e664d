use crate::foundation::error::MontageResult;
use crate::foundation::signal::OnceSignal;
use crate::media::chunk::{MediaKind, TrackConfig};
use crate::mp4::{Mp4Muxer, Sample};

/// Creates muxer tracks from the first encoder output of each kind and holds audio back until
/// the video track exists.
pub(crate) struct TrackSync {
    expect_video: bool,
    cached_audio: Vec<Sample>,
    tracks_ready: OnceSignal,
}

impl TrackSync {
    pub(crate) fn new(expect_video: bool, tracks_ready: OnceSignal) -> Self {
        Self {
            expect_video,
            cached_audio: Vec::new(),
            tracks_ready,
        }
    }

    pub(crate) fn cached(&self) -> usize {
        self.cached_audio.len()
    }

    /// Adds the track for `config` unless one of that kind exists already.
    pub(crate) fn on_config(
        &mut self,
        mux: &mut Mp4Muxer,
        config: &TrackConfig,
    ) -> MontageResult<()> {
        if !mux.has_track(config.kind()) {
            let id = mux.add_track(config)?;
            tracing::debug!(
                track_id = id,
                kind = ?config.kind(),
                codec = config.codec(),
                "track created"
            );
        }
        if config.kind() == MediaKind::Video {
            self.release_audio(mux)?;
        }
        if mux.header_written() && self.tracks_ready.fire() {
            tracing::debug!("all expected tracks ready");
        }
        Ok(())
    }

    pub(crate) fn on_audio(&mut self, mux: &mut Mp4Muxer, sample: Sample) -> MontageResult<()> {
        if self.expect_video && !mux.has_track(MediaKind::Video) {
            self.cached_audio.push(sample);
            return Ok(());
        }
        self.release_audio(mux)?;
        mux.add_sample(MediaKind::Audio, sample)
    }

    pub(crate) fn on_video(&mut self, mux: &mut Mp4Muxer, sample: Sample) -> MontageResult<()> {
        mux.add_sample(MediaKind::Video, sample)
    }

    /// Moves cached audio into the muxer. Called on the video track's creation and at the end,
    /// when a video track may never arrive.
    pub(crate) fn release_audio(&mut self, mux: &mut Mp4Muxer) -> MontageResult<()> {
        if self.cached_audio.is_empty() || !mux.has_track(MediaKind::Audio) {
            return Ok(());
        }
        for s in self.cached_audio.drain(..) {
            mux.add_sample(MediaKind::Audio, s)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "../../tests/unit/remux/track_sync.rs"]
mod tests;
