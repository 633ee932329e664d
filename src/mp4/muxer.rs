use bytes::Bytes;

use crate::foundation::core::MICROS_PER_SEC;
use crate::foundation::error::{MontageError, MontageResult};
use crate::media::chunk::{MediaKind, TrackConfig};
use crate::mp4::Sample;
use crate::mp4::boxes::{
    FileType, Fragment, FragmentSample, Movie, Mp4Box, SampleEntry, TrackFragment, TrackHeader,
};

/// Every track and the movie use microsecond timescales, so sample times need no conversion.
const TIMESCALE: u32 = MICROS_PER_SEC as u32;

/// Which tracks the muxer waits for before writing the init segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackSet {
    pub video: bool,
    pub audio: bool,
}

impl TrackSet {
    pub fn expects(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video => self.video,
            MediaKind::Audio => self.audio,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MuxerOptions {
    pub tracks: TrackSet,
    /// Audio-only fragments are cut once they span this many microseconds.
    pub fragment_duration: i64,
    pub tags: Vec<(String, String)>,
    /// Movie duration in microseconds, written into `mvhd`/`mehd` with the init segment.
    pub duration_hint: Option<i64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MuxerStats {
    pub bytes_flushed: u64,
    pub boxes_flushed: u64,
    pub fragments: u32,
    pub video_samples: u64,
    pub audio_samples: u64,
}

struct MuxTrack {
    track_id: u32,
    kind: MediaKind,
    entry: SampleEntry,
    pending: Vec<Sample>,
    last_dts: Option<i64>,
}

/// Incremental fragmented MP4 writer.
///
/// Top-level boxes accumulate in memory until [`Mp4Muxer::take_flushable`] serializes and drops
/// them. Nothing is flushable before the first `moof`, so a consumer never sees a lone init
/// segment that could still change.
pub struct Mp4Muxer {
    opts: MuxerOptions,
    tracks: Vec<MuxTrack>,
    boxes: Vec<Mp4Box>,
    header_written: bool,
    has_moof: bool,
    finished: bool,
    sequence: u32,
    stats: MuxerStats,
}

impl Mp4Muxer {
    pub fn new(opts: MuxerOptions) -> MontageResult<Self> {
        if !opts.tracks.video && !opts.tracks.audio {
            return Err(MontageError::config("muxer needs at least one expected track"));
        }
        if opts.fragment_duration <= 0 {
            return Err(MontageError::config("fragment duration must be positive"));
        }
        Ok(Self {
            opts,
            tracks: Vec::new(),
            boxes: Vec::new(),
            header_written: false,
            has_moof: false,
            finished: false,
            sequence: 0,
            stats: MuxerStats::default(),
        })
    }

    pub fn has_track(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }

    pub fn header_written(&self) -> bool {
        self.header_written
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn stats(&self) -> MuxerStats {
        self.stats
    }

    /// Creates the track for `config`. Returns the track id.
    pub fn add_track(&mut self, config: &TrackConfig) -> MontageResult<u32> {
        let kind = config.kind();
        if !self.opts.tracks.expects(kind) {
            return Err(MontageError::config(format!(
                "{kind:?} track was not expected by this muxer"
            )));
        }
        if self.has_track(kind) {
            return Err(MontageError::sequence(format!("{kind:?} track already exists")));
        }
        if self.header_written || self.finished {
            return Err(MontageError::sequence(
                "cannot add a track after the init segment was written",
            ));
        }
        let entry = SampleEntry::from_track_config(config)?;
        let track_id = self.tracks.len() as u32 + 1;
        tracing::debug!(track_id, ?kind, codec = %config.codec(), "mp4 track created");
        self.tracks.push(MuxTrack {
            track_id,
            kind,
            entry,
            pending: Vec::new(),
            last_dts: None,
        });

        let all_present = [MediaKind::Video, MediaKind::Audio]
            .into_iter()
            .all(|k| !self.opts.tracks.expects(k) || self.has_track(k));
        if all_present {
            self.write_header();
        }
        Ok(track_id)
    }

    pub fn add_sample(&mut self, kind: MediaKind, sample: Sample) -> MontageResult<()> {
        if self.finished {
            return Err(MontageError::sequence("sample appended after the muxer finished"));
        }
        let Some(idx) = self.tracks.iter().position(|t| t.kind == kind) else {
            return Err(MontageError::sequence(format!(
                "{kind:?} sample appended before its track exists"
            )));
        };
        if let Some(last) = self.tracks[idx].last_dts
            && sample.dts < last
        {
            return Err(MontageError::sequence(format!(
                "{kind:?} sample dts {} is below the previous dts {last}",
                sample.dts
            )));
        }

        if self.header_written && self.should_cut_before(kind, &sample) {
            self.cut_fragment();
        }

        let track = &mut self.tracks[idx];
        track.last_dts = Some(sample.dts);
        track.pending.push(sample);
        match kind {
            MediaKind::Video => self.stats.video_samples += 1,
            MediaKind::Audio => self.stats.audio_samples += 1,
        }
        Ok(())
    }

    fn should_cut_before(&self, kind: MediaKind, sample: &Sample) -> bool {
        if !self.tracks.iter().any(|t| !t.pending.is_empty()) {
            return false;
        }
        if self.opts.tracks.video {
            return kind == MediaKind::Video && sample.is_sync;
        }
        self.tracks.iter().any(|t| {
            t.kind == MediaKind::Audio
                && t.pending.first().is_some_and(|first| {
                    sample.dts.saturating_sub(first.dts) >= self.opts.fragment_duration
                })
        })
    }

    fn write_header(&mut self) {
        let duration = self.opts.duration_hint.map(|d| d.max(0) as u64);
        let movie = Movie {
            timescale: TIMESCALE,
            duration: duration.unwrap_or(0),
            fragment_duration: duration,
            tracks: self
                .tracks
                .iter()
                .map(|t| TrackHeader {
                    track_id: t.track_id,
                    timescale: TIMESCALE,
                    duration: 0,
                    entry: t.entry.clone(),
                })
                .collect(),
            tags: self.opts.tags.clone(),
        };
        self.boxes.push(Mp4Box::Ftyp(FileType::default()));
        self.boxes.push(Mp4Box::Moov(movie));
        self.header_written = true;
        tracing::debug!(tracks = self.tracks.len(), "mp4 init segment written");
    }

    fn cut_fragment(&mut self) {
        let mut trafs = Vec::new();
        let mut payloads = Vec::new();
        for track in &mut self.tracks {
            if track.pending.is_empty() {
                continue;
            }
            let pending = std::mem::take(&mut track.pending);
            let base = pending[0].dts.max(0) as u64;
            let mut samples = Vec::with_capacity(pending.len());
            for (i, s) in pending.iter().enumerate() {
                let duration = match pending.get(i + 1) {
                    Some(next) => next.dts - s.dts,
                    None => s.duration,
                };
                samples.push(FragmentSample {
                    duration: u32::try_from(duration.max(0)).unwrap_or(u32::MAX),
                    size: s.data.len() as u32,
                    is_sync: s.is_sync,
                    cts_offset: i32::try_from(s.cts - s.dts).unwrap_or(0),
                });
            }
            payloads.extend(pending.into_iter().map(|s| s.data));
            trafs.push(TrackFragment {
                track_id: track.track_id,
                base_decode_time: base,
                samples,
            });
        }
        if trafs.is_empty() {
            return;
        }
        self.sequence += 1;
        tracing::trace!(sequence = self.sequence, trafs = trafs.len(), "mp4 fragment cut");
        self.boxes.push(Mp4Box::Moof(Fragment {
            sequence: self.sequence,
            tracks: trafs,
        }));
        self.boxes.push(Mp4Box::Mdat(payloads));
        self.has_moof = true;
        self.stats.fragments += 1;
    }

    /// Serializes and drops every box accumulated since the last call.
    ///
    /// Returns `None` until the first `moof` exists (or the muxer finished) and when nothing new
    /// accumulated.
    pub fn take_flushable(&mut self) -> Option<Bytes> {
        if !(self.has_moof || self.finished) || self.boxes.is_empty() {
            return None;
        }
        let mut out = Vec::new();
        for b in self.boxes.drain(..) {
            b.encode(&mut out);
            self.stats.boxes_flushed += 1;
        }
        self.stats.bytes_flushed += out.len() as u64;
        Some(Bytes::from(out))
    }

    /// Writes whatever is pending as the last fragment.
    ///
    /// A missing expected track is tolerated as long as at least one track exists.
    pub fn finish(&mut self) -> MontageResult<()> {
        if self.finished {
            return Ok(());
        }
        if !self.header_written {
            if self.tracks.is_empty() {
                return Err(MontageError::sequence(
                    "muxer finished before any track was created",
                ));
            }
            tracing::warn!(
                tracks = self.tracks.len(),
                "finishing without every expected track"
            );
            self.write_header();
        }
        self.cut_fragment();
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
#[path = "../../tests/unit/mp4/muxer.rs"]
mod tests;
