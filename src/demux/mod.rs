//! Push-driven MP4 demuxer.
//!
//! Bytes arrive with arbitrary chunk boundaries. `moov` and `moof` are parsed once complete,
//! `mdat` payloads are kept only until every sample referencing them has been emitted, and all
//! other boxes are discarded as they stream past.

use std::collections::{HashMap, VecDeque};

use bytes::{Buf as _, Bytes, BytesMut};

use crate::foundation::error::{MontageError, MontageResult};
use crate::media::chunk::MediaKind;
use crate::mp4::Sample;
use crate::mp4::reader::{
    MovieInfo, RawSample, parse_moof, parse_moov, read_box_header, to_micros,
};

pub mod source;

pub use source::{FrameSource, SourceOptions};

#[derive(Clone, Debug, PartialEq)]
pub enum DemuxEvent {
    /// The movie header was parsed. Emitted once, before any samples.
    Ready(MovieInfo),
    /// Samples of one track in decode order, times in microseconds.
    Samples { track_id: u32, samples: Vec<Sample> },
}

enum State {
    Header,
    /// Inside an `mdat`; `None` runs to the end of the stream.
    Mdat { remaining: Option<u64> },
    Skip { remaining: Option<u64> },
}

/// A retained slice of `mdat` payload starting at absolute offset `start`.
struct Region {
    start: u64,
    data: BytesMut,
    open: bool,
}

impl Region {
    fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }

    fn slice(&self, offset: u64, size: u32) -> Option<Bytes> {
        let end = offset.checked_add(u64::from(size))?;
        if offset < self.start || end > self.end() {
            return None;
        }
        let from = (offset - self.start) as usize;
        Some(Bytes::copy_from_slice(&self.data[from..from + size as usize]))
    }
}

struct WantedTrack {
    timescale: u32,
    queue: VecDeque<RawSample>,
}

pub struct Demuxer {
    kinds: Option<Vec<MediaKind>>,
    pending: BytesMut,
    /// Absolute offset of `pending[0]`.
    pos: u64,
    state: State,
    regions: Vec<Region>,
    movie: Option<MovieInfo>,
    wanted: HashMap<u32, WantedTrack>,
    next_dts: HashMap<u32, u64>,
}

impl Default for Demuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Demuxer {
    /// Demuxes every audio and video track.
    pub fn new() -> Self {
        Self {
            kinds: None,
            pending: BytesMut::new(),
            pos: 0,
            state: State::Header,
            regions: Vec::new(),
            movie: None,
            wanted: HashMap::new(),
            next_dts: HashMap::new(),
        }
    }

    /// Restricts output to the first track of each listed kind.
    pub fn only(mut self, kinds: &[MediaKind]) -> Self {
        self.kinds = Some(kinds.to_vec());
        self
    }

    pub fn movie(&self) -> Option<&MovieInfo> {
        self.movie.as_ref()
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn push(&mut self, data: &[u8]) -> MontageResult<Vec<DemuxEvent>> {
        self.pending.extend_from_slice(data);
        let mut events = Vec::new();
        self.parse(&mut events, false)?;
        self.drain_ready(&mut events);
        Ok(events)
    }

    /// Signals end of stream. Fails when the stream held no `moov`, ended inside a box or left
    /// samples whose data never arrived.
    pub fn finish(&mut self) -> MontageResult<Vec<DemuxEvent>> {
        let mut events = Vec::new();
        self.parse(&mut events, true)?;
        self.drain_ready(&mut events);

        if self.movie.is_none() {
            return Err(MontageError::config("stream ended without a moov box"));
        }
        match self.state {
            State::Header if !self.pending.is_empty() => {
                return Err(MontageError::container(format!(
                    "stream ended inside a box header at offset {}",
                    self.pos
                )));
            }
            State::Mdat { remaining: Some(n) } | State::Skip { remaining: Some(n) } if n > 0 => {
                return Err(MontageError::container(format!(
                    "stream ended {n} bytes before the end of the current box"
                )));
            }
            _ => {}
        }
        let unresolved: usize = self.wanted.values().map(|t| t.queue.len()).sum();
        if unresolved > 0 {
            return Err(MontageError::container(format!(
                "{unresolved} samples reference data missing from the stream"
            )));
        }
        Ok(events)
    }

    fn consume(&mut self, n: usize) {
        self.pending.advance(n);
        self.pos += n as u64;
    }

    fn parse(&mut self, events: &mut Vec<DemuxEvent>, eof: bool) -> MontageResult<()> {
        loop {
            match self.state {
                State::Header => {
                    let Some(h) = read_box_header(&self.pending)? else {
                        return Ok(());
                    };
                    match &h.fourcc {
                        b"mdat" => {
                            let start = self.pos + h.header_len as u64;
                            self.consume(h.header_len);
                            self.regions.push(Region {
                                start,
                                data: BytesMut::new(),
                                open: true,
                            });
                            self.state = State::Mdat {
                                remaining: h.size.map(|s| s - h.header_len as u64),
                            };
                        }
                        b"moov" | b"moof" => {
                            let size = match h.size {
                                Some(s) => usize::try_from(s).map_err(|_| {
                                    MontageError::container("header box does not fit in memory")
                                })?,
                                None if eof => self.pending.len(),
                                None => return Ok(()),
                            };
                            if self.pending.len() < size {
                                return Ok(());
                            }
                            let offset = self.pos;
                            let body = self.pending.split_to(size).freeze();
                            self.pos += size as u64;
                            let body = &body[h.header_len..];
                            if &h.fourcc == b"moov" {
                                self.on_moov(body, events)?;
                            } else {
                                self.on_moof(body, offset)?;
                            }
                        }
                        other => {
                            tracing::trace!(
                                fourcc = %String::from_utf8_lossy(other),
                                size = ?h.size,
                                "skipping box"
                            );
                            self.consume(h.header_len);
                            self.state = State::Skip {
                                remaining: h.size.map(|s| s - h.header_len as u64),
                            };
                        }
                    }
                }
                State::Mdat { remaining } => {
                    let n = take_len(remaining, self.pending.len());
                    if n > 0 {
                        let bytes = self.pending.split_to(n);
                        self.pos += n as u64;
                        if let Some(region) = self.regions.last_mut() {
                            region.data.extend_from_slice(&bytes);
                        }
                    }
                    match remaining {
                        Some(r) if r == n as u64 => {
                            if let Some(region) = self.regions.last_mut() {
                                region.open = false;
                            }
                            self.state = State::Header;
                        }
                        Some(r) => {
                            self.state = State::Mdat {
                                remaining: Some(r - n as u64),
                            };
                            return Ok(());
                        }
                        None => return Ok(()),
                    }
                }
                State::Skip { remaining } => {
                    let n = take_len(remaining, self.pending.len());
                    self.consume(n);
                    match remaining {
                        Some(r) if r == n as u64 => self.state = State::Header,
                        Some(r) => {
                            self.state = State::Skip {
                                remaining: Some(r - n as u64),
                            };
                            return Ok(());
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    fn on_moov(&mut self, body: &[u8], events: &mut Vec<DemuxEvent>) -> MontageResult<()> {
        if self.movie.is_some() {
            return Err(MontageError::container("stream holds more than one moov box"));
        }
        let mut movie = parse_moov(body)?;
        let selected: Vec<u32> = match &self.kinds {
            None => movie.tracks.iter().map(|t| t.track_id).collect(),
            Some(kinds) => kinds
                .iter()
                .filter_map(|k| movie.first_of(*k).map(|t| t.track_id))
                .collect(),
        };
        for track in &mut movie.tracks {
            if !selected.contains(&track.track_id) {
                continue;
            }
            let queue = std::mem::take(&mut track.samples).into();
            self.wanted.insert(
                track.track_id,
                WantedTrack {
                    timescale: track.timescale,
                    queue,
                },
            );
        }
        tracing::debug!(
            tracks = movie.tracks.len(),
            selected = selected.len(),
            fragmented = movie.fragmented,
            duration_us = movie.duration,
            "moov parsed"
        );
        events.push(DemuxEvent::Ready(movie.clone()));
        self.movie = Some(movie);
        Ok(())
    }

    fn on_moof(&mut self, body: &[u8], offset: u64) -> MontageResult<()> {
        let Some(movie) = &self.movie else {
            return Err(MontageError::container("moof box before the moov box"));
        };
        for run in parse_moof(body, offset, movie, &mut self.next_dts)? {
            if let Some(track) = self.wanted.get_mut(&run.track_id) {
                track.queue.extend(run.samples);
            }
        }
        Ok(())
    }

    fn resolve(&self, sample: &RawSample) -> Option<Bytes> {
        self.regions
            .iter()
            .find_map(|r| r.slice(sample.offset, sample.size))
    }

    fn drain_ready(&mut self, events: &mut Vec<DemuxEvent>) {
        if self.movie.is_none() {
            return;
        }
        let mut ids: Vec<u32> = self.wanted.keys().copied().collect();
        ids.sort_unstable();

        loop {
            let mut best: Option<(u64, u32, Bytes)> = None;
            for id in &ids {
                let Some(head) = self.wanted.get(id).and_then(|t| t.queue.front()) else {
                    continue;
                };
                if best.as_ref().is_some_and(|(off, _, _)| *off <= head.offset) {
                    continue;
                }
                if let Some(data) = self.resolve(head) {
                    best = Some((head.offset, *id, data));
                }
            }
            let Some((_, id, data)) = best else {
                break;
            };
            let Some(track) = self.wanted.get_mut(&id) else {
                break;
            };
            let Some(raw) = track.queue.pop_front() else {
                break;
            };
            let sample = to_sample(&raw, track.timescale, data);
            match events.last_mut() {
                Some(DemuxEvent::Samples { track_id, samples }) if *track_id == id => {
                    samples.push(sample);
                }
                _ => events.push(DemuxEvent::Samples {
                    track_id: id,
                    samples: vec![sample],
                }),
            }
        }
        self.prune();
    }

    /// Drops payload bytes no queued sample can reference any more.
    fn prune(&mut self) {
        let cut = self
            .wanted
            .values()
            .filter_map(|t| t.queue.iter().map(|s| s.offset).min())
            .min()
            .unwrap_or(u64::MAX);
        for region in &mut self.regions {
            if region.start < cut {
                let n = (cut.min(region.end()) - region.start) as usize;
                region.data.advance(n);
                region.start += n as u64;
            }
        }
        self.regions.retain(|r| r.open || !r.data.is_empty());
    }
}

fn take_len(remaining: Option<u64>, available: usize) -> usize {
    match remaining {
        Some(r) => usize::try_from(r).map_or(available, |r| r.min(available)),
        None => available,
    }
}

fn to_sample(raw: &RawSample, timescale: u32, data: Bytes) -> Sample {
    let dts = to_micros(raw.dts, timescale);
    let end = to_micros(raw.dts + u64::from(raw.duration), timescale);
    let cts = to_micros(raw.dts.saturating_add_signed(i64::from(raw.cts_offset)), timescale);
    Sample {
        dts,
        cts,
        duration: end - dts,
        is_sync: raw.is_sync,
        data,
    }
}

#[cfg(test)]
#[path = "../../tests/unit/demux/mod.rs"]
mod tests;
