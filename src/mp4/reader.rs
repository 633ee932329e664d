//! Parser for the boxes the demuxer needs: box headers, `moov` (including progressive sample
//! tables) and `moof`.

use std::collections::HashMap;

use bytes::Bytes;

use crate::foundation::core::MICROS_PER_SEC;
use crate::foundation::error::{MontageError, MontageResult};
use crate::foundation::math::rescale;
use crate::media::chunk::{MediaKind, TrackConfig};
use crate::mp4::boxes::{FourCc, SampleEntry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoxHeader {
    pub fourcc: FourCc,
    pub header_len: usize,
    /// Total size including the header; `None` means the box extends to the end of the stream.
    pub size: Option<u64>,
}

/// Parse a box header at the start of `buf`. Returns `Ok(None)` when more bytes are needed.
pub fn read_box_header(buf: &[u8]) -> MontageResult<Option<BoxHeader>> {
    if buf.len() < 8 {
        return Ok(None);
    }
    let size32 = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let fourcc = [buf[4], buf[5], buf[6], buf[7]];
    let (size, header_len) = match size32 {
        0 => (None, 8),
        1 => {
            if buf.len() < 16 {
                return Ok(None);
            }
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[8..16]);
            (Some(u64::from_be_bytes(b)), 16)
        }
        n => (Some(u64::from(n)), 8),
    };
    if let Some(s) = size
        && s < header_len as u64
    {
        return Err(MontageError::container(format!(
            "box '{}' declares size {s} smaller than its header",
            String::from_utf8_lossy(&fourcc)
        )));
    }
    Ok(Some(BoxHeader {
        fourcc,
        header_len,
        size,
    }))
}

/// Bounds-checked big-endian cursor over a box body.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    fn take(&mut self, n: usize) -> MontageResult<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(MontageError::container(format!("truncated '{}' box", self.what)));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn skip(&mut self, n: usize) -> MontageResult<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> MontageResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> MontageResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> MontageResult<u32> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    fn u32(&mut self) -> MontageResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> MontageResult<i32> {
        Ok(self.u32()? as i32)
    }

    fn u64(&mut self) -> MontageResult<u64> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_be_bytes(a))
    }

    fn fourcc(&mut self) -> MontageResult<FourCc> {
        let b = self.take(4)?;
        Ok([b[0], b[1], b[2], b[3]])
    }

    /// `(version, flags)` of a full box.
    fn full_header(&mut self) -> MontageResult<(u8, u32)> {
        let v = self.u32()?;
        Ok(((v >> 24) as u8, v & 0x00FF_FFFF))
    }

    fn rest(&mut self) -> &'a [u8] {
        let s = &self.buf[self.pos..];
        self.pos = self.buf.len();
        s
    }
}

/// Split a container body into its child boxes.
fn children(body: &[u8]) -> MontageResult<Vec<(FourCc, &[u8])>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while body.len() - pos >= 8 {
        let Some(h) = read_box_header(&body[pos..])? else {
            break;
        };
        let size = match h.size {
            Some(s) => usize::try_from(s)
                .map_err(|_| MontageError::container("box size does not fit in memory"))?,
            None => body.len() - pos,
        };
        if size > body.len() - pos {
            return Err(MontageError::container(format!(
                "child box '{}' overruns its parent",
                String::from_utf8_lossy(&h.fourcc)
            )));
        }
        out.push((h.fourcc, &body[pos + h.header_len..pos + size]));
        pos += size;
    }
    Ok(out)
}

fn child<'a>(kids: &[(FourCc, &'a [u8])], fourcc: &FourCc) -> Option<&'a [u8]> {
    kids.iter().find(|(f, _)| f == fourcc).map(|(_, b)| *b)
}

fn require<'a>(kids: &[(FourCc, &'a [u8])], fourcc: &FourCc) -> MontageResult<&'a [u8]> {
    child(kids, fourcc).ok_or_else(|| {
        MontageError::container(format!(
            "missing required '{}' box",
            String::from_utf8_lossy(fourcc)
        ))
    })
}

/// One sample location in track timescale units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawSample {
    pub offset: u64,
    pub size: u32,
    pub dts: u64,
    pub duration: u32,
    pub cts_offset: i32,
    pub is_sync: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrexDefaults {
    pub duration: u32,
    pub size: u32,
    pub flags: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackInfo {
    pub track_id: u32,
    pub kind: MediaKind,
    pub timescale: u32,
    /// Microseconds; 0 when unknown.
    pub duration: i64,
    pub entry: SampleEntry,
    pub config: TrackConfig,
    /// Progressive sample table; empty for fragmented files.
    pub samples: Vec<RawSample>,
    pub trex: TrexDefaults,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MovieInfo {
    pub timescale: u32,
    /// Microseconds; 0 when unknown.
    pub duration: i64,
    pub fragmented: bool,
    pub tracks: Vec<TrackInfo>,
    pub tags: Vec<(String, String)>,
}

impl MovieInfo {
    pub fn track(&self, track_id: u32) -> Option<&TrackInfo> {
        self.tracks.iter().find(|t| t.track_id == track_id)
    }

    pub fn first_of(&self, kind: MediaKind) -> Option<&TrackInfo> {
        self.tracks.iter().find(|t| t.kind == kind)
    }
}

pub(crate) fn to_micros(value: u64, timescale: u32) -> i64 {
    i64::try_from(rescale(value, timescale, MICROS_PER_SEC as u32)).unwrap_or(i64::MAX)
}

pub fn parse_moov(body: &[u8]) -> MontageResult<MovieInfo> {
    let kids = children(body)?;

    let mut c = Cursor::new(require(&kids, b"mvhd")?, "mvhd");
    let (version, _) = c.full_header()?;
    let (timescale, mut duration) = if version == 1 {
        c.skip(16)?;
        (c.u32()?, c.u64()?)
    } else {
        c.skip(8)?;
        (c.u32()?, u64::from(c.u32()?))
    };
    if duration == u64::MAX || (version == 0 && duration == u64::from(u32::MAX)) {
        duration = 0;
    }

    let mut fragmented = false;
    let mut trex = HashMap::<u32, TrexDefaults>::new();
    if let Some(mvex) = child(&kids, b"mvex") {
        fragmented = true;
        for (fourcc, b) in children(mvex)? {
            match &fourcc {
                b"mehd" => {
                    let mut c = Cursor::new(b, "mehd");
                    let (v, _) = c.full_header()?;
                    let d = if v == 1 { c.u64()? } else { u64::from(c.u32()?) };
                    if duration == 0 {
                        duration = d;
                    }
                }
                b"trex" => {
                    let mut c = Cursor::new(b, "trex");
                    c.full_header()?;
                    let id = c.u32()?;
                    c.skip(4)?;
                    trex.insert(
                        id,
                        TrexDefaults {
                            duration: c.u32()?,
                            size: c.u32()?,
                            flags: c.u32()?,
                        },
                    );
                }
                _ => {}
            }
        }
    }

    let mut tracks = Vec::new();
    for (fourcc, b) in &kids {
        if fourcc == b"trak"
            && let Some(mut t) = parse_trak(b)?
        {
            t.trex = trex.get(&t.track_id).copied().unwrap_or_default();
            tracks.push(t);
        }
    }

    let tags = match child(&kids, b"udta") {
        Some(udta) => parse_udta(udta)?,
        None => Vec::new(),
    };

    let mut duration_us = to_micros(duration, timescale);
    if duration_us == 0 {
        duration_us = tracks.iter().map(|t| t.duration).max().unwrap_or(0);
    }

    Ok(MovieInfo {
        timescale,
        duration: duration_us,
        fragmented,
        tracks,
        tags,
    })
}

fn parse_trak(body: &[u8]) -> MontageResult<Option<TrackInfo>> {
    let kids = children(body)?;

    let mut c = Cursor::new(require(&kids, b"tkhd")?, "tkhd");
    let (version, _) = c.full_header()?;
    let track_id = if version == 1 {
        c.skip(16)?;
        let id = c.u32()?;
        c.skip(4 + 8)?;
        id
    } else {
        c.skip(8)?;
        let id = c.u32()?;
        c.skip(4 + 4)?;
        id
    };
    c.skip(8 + 2 + 2 + 2 + 2 + 36)?;
    let dims = (c.u32()? >> 16, c.u32()? >> 16);

    let mdia = children(require(&kids, b"mdia")?)?;
    let mut c = Cursor::new(require(&mdia, b"mdhd")?, "mdhd");
    let (version, _) = c.full_header()?;
    let (timescale, duration) = if version == 1 {
        c.skip(16)?;
        (c.u32()?, c.u64()?)
    } else {
        c.skip(8)?;
        (c.u32()?, u64::from(c.u32()?))
    };
    if timescale == 0 {
        return Err(MontageError::container(format!(
            "track {track_id} has a zero timescale"
        )));
    }

    let mut c = Cursor::new(require(&mdia, b"hdlr")?, "hdlr");
    c.full_header()?;
    c.skip(4)?;
    let kind = match &c.fourcc()? {
        b"vide" => MediaKind::Video,
        b"soun" => MediaKind::Audio,
        other => {
            tracing::debug!(
                track_id,
                handler = %String::from_utf8_lossy(other),
                "skipping non audio/video track"
            );
            return Ok(None);
        }
    };

    let minf = children(require(&mdia, b"minf")?)?;
    let stbl = children(require(&minf, b"stbl")?)?;
    let entry = parse_stsd(require(&stbl, b"stsd")?, kind)?;
    let samples = parse_sample_table(&stbl)?;

    let mut duration_us = to_micros(duration, timescale);
    if (duration_us == 0 || duration == u64::from(u32::MAX))
        && let Some(last) = samples.last()
    {
        duration_us = to_micros(last.dts + u64::from(last.duration), timescale);
    }

    let audio = match &entry {
        SampleEntry::Mp4a {
            sample_rate,
            channels,
            ..
        }
        | SampleEntry::Ipcm {
            sample_rate,
            channels,
            ..
        } => (*sample_rate, *channels),
        _ => (timescale, 2),
    };
    let config = entry.to_track_config(dims, audio);

    Ok(Some(TrackInfo {
        track_id,
        kind,
        timescale,
        duration: duration_us,
        entry,
        config,
        samples,
        trex: TrexDefaults::default(),
    }))
}

fn parse_stsd(body: &[u8], kind: MediaKind) -> MontageResult<SampleEntry> {
    let mut c = Cursor::new(body, "stsd");
    c.full_header()?;
    let count = c.u32()?;
    if count == 0 {
        return Err(MontageError::container("stsd has no sample entries"));
    }
    let entries = children(c.rest())?;
    let Some((fourcc, b)) = entries.first() else {
        return Err(MontageError::container("stsd has no sample entries"));
    };
    let mut c = Cursor::new(b, "sample entry");
    c.skip(8)?;

    match fourcc {
        b"avc1" | b"avc3" | b"mp4v" => {
            c.skip(16)?;
            let width = c.u16()?;
            let height = c.u16()?;
            c.skip(4 + 4 + 4 + 2 + 32 + 2 + 2)?;
            let kids = children(c.rest())?;
            if fourcc == b"mp4v" {
                let (object_type, decoder_specific) = parse_esds(require(&kids, b"esds")?)?;
                Ok(SampleEntry::Mp4v {
                    width,
                    height,
                    object_type,
                    decoder_specific,
                })
            } else {
                Ok(SampleEntry::Avc1 {
                    width,
                    height,
                    avcc: Bytes::copy_from_slice(require(&kids, b"avcC")?),
                })
            }
        }
        b"mp4a" | b"ipcm" => {
            let version = c.u16()?;
            c.skip(6)?;
            let channels = c.u16()?;
            let sample_size = c.u16()?;
            c.skip(4)?;
            let sample_rate = c.u32()? >> 16;
            match version {
                1 => c.skip(16)?,
                2 => c.skip(36)?,
                _ => {}
            }
            let kids = children(c.rest())?;
            if fourcc == b"mp4a" {
                let (object_type, decoder_specific) = parse_esds(require(&kids, b"esds")?)?;
                Ok(SampleEntry::Mp4a {
                    sample_rate,
                    channels,
                    object_type,
                    decoder_specific,
                })
            } else {
                let (little_endian, size) = match child(&kids, b"pcmC") {
                    Some(p) => {
                        let mut c = Cursor::new(p, "pcmC");
                        c.full_header()?;
                        (c.u8()? & 1 == 1, c.u8()?)
                    }
                    None => (false, sample_size as u8),
                };
                Ok(SampleEntry::Ipcm {
                    sample_rate,
                    channels,
                    sample_size: size,
                    little_endian,
                })
            }
        }
        other => Ok(SampleEntry::Unsupported {
            fourcc: *other,
            kind,
        }),
    }
}

fn read_descriptor<'a>(c: &mut Cursor<'a>) -> MontageResult<(u8, &'a [u8])> {
    let tag = c.u8()?;
    let mut len = 0usize;
    for _ in 0..4 {
        let b = c.u8()?;
        len = (len << 7) | usize::from(b & 0x7F);
        if b & 0x80 == 0 {
            break;
        }
    }
    Ok((tag, c.take(len)?))
}

/// `(object_type_indication, decoder_specific_info)` from an `esds` body.
fn parse_esds(body: &[u8]) -> MontageResult<(u8, Bytes)> {
    let mut c = Cursor::new(body, "esds");
    c.full_header()?;
    let (tag, es) = read_descriptor(&mut c)?;
    if tag != 0x03 {
        return Err(MontageError::container("esds does not start with an ES descriptor"));
    }
    let mut c = Cursor::new(es, "esds");
    c.skip(2)?;
    let flags = c.u8()?;
    if flags & 0x80 != 0 {
        c.skip(2)?;
    }
    if flags & 0x40 != 0 {
        let n = c.u8()?;
        c.skip(usize::from(n))?;
    }
    if flags & 0x20 != 0 {
        c.skip(2)?;
    }
    loop {
        let (tag, body) = read_descriptor(&mut c)?;
        if tag != 0x04 {
            continue;
        }
        let mut d = Cursor::new(body, "esds");
        let object_type = d.u8()?;
        d.skip(1 + 3 + 4 + 4)?;
        let mut dsi = Bytes::new();
        while d.pos < d.buf.len() {
            let (tag, b) = read_descriptor(&mut d)?;
            if tag == 0x05 {
                dsi = Bytes::copy_from_slice(b);
                break;
            }
        }
        return Ok((object_type, dsi));
    }
}

fn parse_sample_table(stbl: &[(FourCc, &[u8])]) -> MontageResult<Vec<RawSample>> {
    let mut c = Cursor::new(require(stbl, b"stsz")?, "stsz");
    c.full_header()?;
    let fixed = c.u32()?;
    let count = c.u32()? as usize;
    if count == 0 {
        return Ok(Vec::new());
    }
    let sizes = if fixed != 0 {
        vec![fixed; count]
    } else {
        (0..count).map(|_| c.u32()).collect::<MontageResult<Vec<_>>>()?
    };

    let mut c = Cursor::new(require(stbl, b"stts")?, "stts");
    c.full_header()?;
    let n = c.u32()? as usize;
    let mut deltas = Vec::with_capacity(count);
    for _ in 0..n {
        let run = c.u32()?;
        let delta = c.u32()?;
        for _ in 0..run {
            if deltas.len() == count {
                break;
            }
            deltas.push(delta);
        }
    }
    deltas.resize(count, deltas.last().copied().unwrap_or(0));

    let mut cts = vec![0i32; count];
    if let Some(ctts) = child(stbl, b"ctts") {
        let mut c = Cursor::new(ctts, "ctts");
        c.full_header()?;
        let n = c.u32()? as usize;
        let mut i = 0usize;
        for _ in 0..n {
            let run = c.u32()?;
            let off = c.i32()?;
            for _ in 0..run {
                if i < count {
                    cts[i] = off;
                    i += 1;
                }
            }
        }
    }

    let sync: Option<Vec<bool>> = match child(stbl, b"stss") {
        Some(stss) => {
            let mut c = Cursor::new(stss, "stss");
            c.full_header()?;
            let n = c.u32()? as usize;
            let mut v = vec![false; count];
            for _ in 0..n {
                let idx = c.u32()? as usize;
                if idx >= 1 && idx <= count {
                    v[idx - 1] = true;
                }
            }
            Some(v)
        }
        None => None,
    };

    let chunk_offsets: Vec<u64> = if let Some(stco) = child(stbl, b"stco") {
        let mut c = Cursor::new(stco, "stco");
        c.full_header()?;
        let n = c.u32()? as usize;
        (0..n)
            .map(|_| c.u32().map(u64::from))
            .collect::<MontageResult<_>>()?
    } else {
        let mut c = Cursor::new(require(stbl, b"co64")?, "co64");
        c.full_header()?;
        let n = c.u32()? as usize;
        (0..n).map(|_| c.u64()).collect::<MontageResult<_>>()?
    };

    let mut c = Cursor::new(require(stbl, b"stsc")?, "stsc");
    c.full_header()?;
    let n = c.u32()? as usize;
    let mut runs = Vec::with_capacity(n);
    for _ in 0..n {
        let first_chunk = c.u32()?;
        let per_chunk = c.u32()?;
        c.skip(4)?;
        runs.push((first_chunk.max(1) as usize, per_chunk as usize));
    }

    let mut out = Vec::with_capacity(count);
    let mut dts = 0u64;
    let mut sample = 0usize;
    for (ri, &(first, per_chunk)) in runs.iter().enumerate() {
        let last = runs
            .get(ri + 1)
            .map_or(chunk_offsets.len(), |(next, _)| next - 1);
        for chunk in first..=last {
            let Some(&base) = chunk_offsets.get(chunk - 1) else {
                break;
            };
            let mut offset = base;
            for _ in 0..per_chunk {
                if sample == count {
                    break;
                }
                out.push(RawSample {
                    offset,
                    size: sizes[sample],
                    dts,
                    duration: deltas[sample],
                    cts_offset: cts[sample],
                    is_sync: sync.as_ref().is_none_or(|s| s[sample]),
                });
                offset += u64::from(sizes[sample]);
                dts += u64::from(deltas[sample]);
                sample += 1;
            }
        }
    }
    if out.len() != count {
        return Err(MontageError::container(format!(
            "sample table maps {} of {count} samples to chunks",
            out.len()
        )));
    }
    Ok(out)
}

fn parse_udta(body: &[u8]) -> MontageResult<Vec<(String, String)>> {
    let mut tags = Vec::new();
    let Some(meta) = child(&children(body)?, b"meta") else {
        return Ok(tags);
    };
    if meta.len() < 4 {
        return Ok(tags);
    }
    let Some(ilst) = child(&children(&meta[4..])?, b"ilst") else {
        return Ok(tags);
    };
    for (fourcc, item) in children(ilst)? {
        if &fourcc != b"----" {
            continue;
        }
        let kids = children(item)?;
        let (Some(name), Some(data)) = (child(&kids, b"name"), child(&kids, b"data")) else {
            continue;
        };
        if name.len() < 4 || data.len() < 8 {
            continue;
        }
        tags.push((
            String::from_utf8_lossy(&name[4..]).into_owned(),
            String::from_utf8_lossy(&data[8..]).into_owned(),
        ));
    }
    Ok(tags)
}

/// Samples of one `traf`, with absolute file offsets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackRun {
    pub track_id: u32,
    pub samples: Vec<RawSample>,
}

/// Parse a `moof` body located at absolute offset `moof_offset`.
///
/// `next_dts` carries each track's running decode time for fragments without `tfdt`.
pub fn parse_moof(
    body: &[u8],
    moof_offset: u64,
    movie: &MovieInfo,
    next_dts: &mut HashMap<u32, u64>,
) -> MontageResult<Vec<TrackRun>> {
    let mut runs = Vec::new();
    for (fourcc, traf) in children(body)? {
        if &fourcc != b"traf" {
            continue;
        }
        let kids = children(traf)?;

        let mut c = Cursor::new(require(&kids, b"tfhd")?, "tfhd");
        let (_, flags) = c.full_header()?;
        let track_id = c.u32()?;
        let Some(track) = movie.track(track_id) else {
            tracing::trace!(track_id, "skipping fragment of an ignored track");
            continue;
        };
        let base_offset = if flags & 0x01 != 0 {
            c.u64()?
        } else {
            moof_offset
        };
        if flags & 0x02 != 0 {
            c.skip(4)?;
        }
        let default_duration = if flags & 0x08 != 0 {
            c.u32()?
        } else {
            track.trex.duration
        };
        let default_size = if flags & 0x10 != 0 {
            c.u32()?
        } else {
            track.trex.size
        };
        let default_flags = if flags & 0x20 != 0 {
            c.u32()?
        } else {
            track.trex.flags
        };

        let mut dts = match child(&kids, b"tfdt") {
            Some(b) => {
                let mut c = Cursor::new(b, "tfdt");
                let (v, _) = c.full_header()?;
                if v == 1 { c.u64()? } else { u64::from(c.u32()?) }
            }
            None => next_dts.get(&track_id).copied().unwrap_or(0),
        };

        let mut samples = Vec::new();
        let mut data_end = base_offset;
        for (fourcc, b) in &kids {
            if fourcc != b"trun" {
                continue;
            }
            let mut c = Cursor::new(b, "trun");
            let (_, tr_flags) = c.full_header()?;
            let count = c.u32()?;
            let mut offset = if tr_flags & 0x01 != 0 {
                base_offset.saturating_add_signed(i64::from(c.i32()?))
            } else {
                data_end
            };
            let first_flags = if tr_flags & 0x04 != 0 {
                Some(c.u32()?)
            } else {
                None
            };
            for i in 0..count {
                let duration = if tr_flags & 0x100 != 0 {
                    c.u32()?
                } else {
                    default_duration
                };
                let size = if tr_flags & 0x200 != 0 {
                    c.u32()?
                } else {
                    default_size
                };
                let sflags = if tr_flags & 0x400 != 0 {
                    c.u32()?
                } else if i == 0
                    && let Some(f) = first_flags
                {
                    f
                } else {
                    default_flags
                };
                let cts_offset = if tr_flags & 0x800 != 0 { c.i32()? } else { 0 };
                samples.push(RawSample {
                    offset,
                    size,
                    dts,
                    duration,
                    cts_offset,
                    is_sync: sflags & 0x0001_0000 == 0,
                });
                offset += u64::from(size);
                dts += u64::from(duration);
            }
            data_end = offset;
        }
        next_dts.insert(track_id, dts);
        runs.push(TrackRun { track_id, samples });
    }
    Ok(runs)
}

#[cfg(test)]
#[path = "../../tests/unit/mp4/reader.rs"]
mod tests;
