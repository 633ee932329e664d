//! ISO BMFF box model and serializer for the fragmented layout:
//! `ftyp`, `moov` (with `mvex`), then `moof`/`mdat` pairs.

use bytes::{BufMut as _, Bytes};

use crate::foundation::error::{MontageError, MontageResult};
use crate::media::chunk::{AudioTrackConfig, MediaKind, TrackConfig, VideoTrackConfig};

pub type FourCc = [u8; 4];

/// `sample_depends_on = 2`: an independently decodable sample.
pub const SAMPLE_FLAGS_SYNC: u32 = 0x0200_0000;
/// `sample_depends_on = 1` plus `sample_is_non_sync_sample`.
pub const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000;

const UNITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileType {
    pub major_brand: FourCc,
    pub minor_version: u32,
    pub compatible_brands: Vec<FourCc>,
}

impl Default for FileType {
    fn default() -> Self {
        Self {
            major_brand: *b"isom",
            minor_version: 0x200,
            compatible_brands: vec![*b"isom", *b"iso5", *b"iso6", *b"mp41"],
        }
    }
}

/// Codec-specific sample description stored in `stsd`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SampleEntry {
    Avc1 {
        width: u16,
        height: u16,
        avcc: Bytes,
    },
    /// MPEG-4 visual entry, addressed by object type (0x6C = JPEG).
    Mp4v {
        width: u16,
        height: u16,
        object_type: u8,
        decoder_specific: Bytes,
    },
    Mp4a {
        sample_rate: u32,
        channels: u16,
        object_type: u8,
        decoder_specific: Bytes,
    },
    /// ISO/IEC 23003-5 uncompressed integer PCM.
    Ipcm {
        sample_rate: u32,
        channels: u16,
        sample_size: u8,
        little_endian: bool,
    },
    /// A sample entry this crate can read but not describe further.
    Unsupported { fourcc: FourCc, kind: MediaKind },
}

impl SampleEntry {
    pub fn from_track_config(config: &TrackConfig) -> MontageResult<Self> {
        match config {
            TrackConfig::Video(v) => {
                let width = u16::try_from(v.width)
                    .map_err(|_| MontageError::config("video width exceeds 65535"))?;
                let height = u16::try_from(v.height)
                    .map_err(|_| MontageError::config("video height exceeds 65535"))?;
                if v.codec.starts_with("avc1") || v.codec.starts_with("avc3") {
                    Ok(Self::Avc1 {
                        width,
                        height,
                        avcc: v.description.clone(),
                    })
                } else if v.codec == crate::codec::jpeg::CODEC {
                    Ok(Self::Mp4v {
                        width,
                        height,
                        object_type: crate::codec::jpeg::OBJECT_TYPE_JPEG,
                        decoder_specific: v.description.clone(),
                    })
                } else {
                    Err(MontageError::config(format!(
                        "video codec '{}' has no MP4 sample entry mapping",
                        v.codec
                    )))
                }
            }
            TrackConfig::Audio(a) => {
                if a.codec.starts_with("mp4a") {
                    Ok(Self::Mp4a {
                        sample_rate: a.sample_rate,
                        channels: a.channels,
                        object_type: 0x40,
                        decoder_specific: a.description.clone(),
                    })
                } else if a.codec == crate::codec::pcm::CODEC {
                    Ok(Self::Ipcm {
                        sample_rate: a.sample_rate,
                        channels: a.channels,
                        sample_size: 16,
                        little_endian: true,
                    })
                } else {
                    Err(MontageError::config(format!(
                        "audio codec '{}' has no MP4 sample entry mapping",
                        a.codec
                    )))
                }
            }
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Avc1 { .. } | Self::Mp4v { .. } => MediaKind::Video,
            Self::Mp4a { .. } | Self::Ipcm { .. } => MediaKind::Audio,
            Self::Unsupported { kind, .. } => *kind,
        }
    }

    /// Codec string understood by [`crate::codec::CodecFactory`].
    pub fn codec_string(&self) -> String {
        match self {
            Self::Avc1 { avcc, .. } if avcc.len() >= 4 => {
                format!("avc1.{:02x}{:02x}{:02x}", avcc[1], avcc[2], avcc[3])
            }
            Self::Avc1 { .. } => "avc1".to_owned(),
            Self::Mp4v { object_type, .. }
                if *object_type == crate::codec::jpeg::OBJECT_TYPE_JPEG =>
            {
                crate::codec::jpeg::CODEC.to_owned()
            }
            Self::Mp4v { object_type, .. } => format!("mp4v.{object_type:02x}"),
            Self::Mp4a {
                object_type,
                decoder_specific,
                ..
            } => {
                if *object_type == 0x40 {
                    let aot = decoder_specific.first().map_or(2, |b| b >> 3);
                    format!("mp4a.40.{aot}")
                } else {
                    format!("mp4a.{object_type:02x}")
                }
            }
            Self::Ipcm {
                sample_size: 16,
                little_endian: true,
                ..
            } => crate::codec::pcm::CODEC.to_owned(),
            Self::Ipcm {
                sample_size,
                little_endian,
                ..
            } => format!(
                "ipcm-s{sample_size}{}",
                if *little_endian { "le" } else { "be" }
            ),
            Self::Unsupported { fourcc, .. } => String::from_utf8_lossy(fourcc).into_owned(),
        }
    }

    /// Track configuration for decoders. `dims` and `audio` fill in what the entry lacks.
    pub fn to_track_config(&self, dims: (u32, u32), audio: (u32, u16)) -> TrackConfig {
        let codec = self.codec_string();
        match self {
            Self::Avc1 {
                width,
                height,
                avcc,
            } => TrackConfig::Video(VideoTrackConfig {
                codec,
                width: u32::from(*width),
                height: u32::from(*height),
                description: avcc.clone(),
            }),
            Self::Mp4v {
                width,
                height,
                decoder_specific,
                ..
            } => TrackConfig::Video(VideoTrackConfig {
                codec,
                width: u32::from(*width),
                height: u32::from(*height),
                description: decoder_specific.clone(),
            }),
            Self::Mp4a {
                sample_rate,
                channels,
                decoder_specific,
                ..
            } => TrackConfig::Audio(AudioTrackConfig {
                codec,
                sample_rate: *sample_rate,
                channels: *channels,
                description: decoder_specific.clone(),
            }),
            Self::Ipcm {
                sample_rate,
                channels,
                ..
            } => TrackConfig::Audio(AudioTrackConfig {
                codec,
                sample_rate: *sample_rate,
                channels: *channels,
                description: Bytes::new(),
            }),
            Self::Unsupported {
                kind: MediaKind::Video,
                ..
            } => TrackConfig::Video(VideoTrackConfig {
                codec,
                width: dims.0,
                height: dims.1,
                description: Bytes::new(),
            }),
            Self::Unsupported {
                kind: MediaKind::Audio,
                ..
            } => TrackConfig::Audio(AudioTrackConfig {
                codec,
                sample_rate: audio.0,
                channels: audio.1,
                description: Bytes::new(),
            }),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Avc1 {
                width,
                height,
                avcc,
            } => {
                let start = begin(out, b"avc1");
                put_visual_fields(out, *width, *height);
                let c = begin(out, b"avcC");
                out.extend_from_slice(avcc);
                end(out, c);
                end(out, start);
            }
            Self::Mp4v {
                width,
                height,
                object_type,
                decoder_specific,
            } => {
                let start = begin(out, b"mp4v");
                put_visual_fields(out, *width, *height);
                put_esds(out, *object_type, 0x04, decoder_specific);
                end(out, start);
            }
            Self::Mp4a {
                sample_rate,
                channels,
                object_type,
                decoder_specific,
            } => {
                let start = begin(out, b"mp4a");
                put_audio_fields(out, *sample_rate, *channels, 16);
                put_esds(out, *object_type, 0x05, decoder_specific);
                end(out, start);
            }
            Self::Ipcm {
                sample_rate,
                channels,
                sample_size,
                little_endian,
            } => {
                let start = begin(out, b"ipcm");
                put_audio_fields(out, *sample_rate, *channels, u16::from(*sample_size));
                let c = begin_full(out, b"pcmC", 0, 0);
                out.put_u8(u8::from(*little_endian));
                out.put_u8(*sample_size);
                end(out, c);
                end(out, start);
            }
            Self::Unsupported { fourcc, .. } => {
                let start = begin(out, fourcc);
                out.put_bytes(0, 6);
                out.put_u16(1);
                end(out, start);
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackHeader {
    pub track_id: u32,
    pub timescale: u32,
    /// In track timescale units; 0 when unknown.
    pub duration: u64,
    pub entry: SampleEntry,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Movie {
    pub timescale: u32,
    /// In movie timescale units; 0 when unknown.
    pub duration: u64,
    /// Written as `mehd` when known.
    pub fragment_duration: Option<u64>,
    pub tracks: Vec<TrackHeader>,
    /// Freeform `udta` metadata as `(name, value)`.
    pub tags: Vec<(String, String)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentSample {
    pub duration: u32,
    pub size: u32,
    pub is_sync: bool,
    pub cts_offset: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackFragment {
    pub track_id: u32,
    pub base_decode_time: u64,
    pub samples: Vec<FragmentSample>,
}

impl TrackFragment {
    pub fn data_len(&self) -> u64 {
        self.samples.iter().map(|s| u64::from(s.size)).sum()
    }
}

/// A `moof`. Sample data for each track fragment is expected in the following `mdat`, in track
/// fragment order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub sequence: u32,
    pub tracks: Vec<TrackFragment>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Mp4Box {
    Ftyp(FileType),
    Moov(Movie),
    Moof(Fragment),
    Mdat(Vec<Bytes>),
}

impl Mp4Box {
    pub fn fourcc(&self) -> FourCc {
        match self {
            Self::Ftyp(_) => *b"ftyp",
            Self::Moov(_) => *b"moov",
            Self::Moof(_) => *b"moof",
            Self::Mdat(_) => *b"mdat",
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Ftyp(ftyp) => encode_ftyp(out, ftyp),
            Self::Moov(movie) => encode_moov(out, movie),
            Self::Moof(fragment) => encode_moof(out, fragment),
            Self::Mdat(payloads) => encode_mdat(out, payloads),
        }
    }
}

fn begin(out: &mut Vec<u8>, fourcc: &FourCc) -> usize {
    let start = out.len();
    out.put_u32(0);
    out.extend_from_slice(fourcc);
    start
}

fn begin_full(out: &mut Vec<u8>, fourcc: &FourCc, version: u8, flags: u32) -> usize {
    let start = begin(out, fourcc);
    out.put_u32((u32::from(version) << 24) | (flags & 0x00FF_FFFF));
    start
}

fn end(out: &mut [u8], start: usize) {
    let size = (out.len() - start) as u32;
    out[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

fn put_matrix(out: &mut Vec<u8>) {
    for v in UNITY_MATRIX {
        out.put_u32(v);
    }
}

fn put_visual_fields(out: &mut Vec<u8>, width: u16, height: u16) {
    out.put_bytes(0, 6);
    out.put_u16(1); // data_reference_index
    out.put_u16(0);
    out.put_u16(0);
    out.put_bytes(0, 12);
    out.put_u16(width);
    out.put_u16(height);
    out.put_u32(0x0048_0000); // 72 dpi
    out.put_u32(0x0048_0000);
    out.put_u32(0);
    out.put_u16(1); // frame_count
    out.put_bytes(0, 32); // compressorname
    out.put_u16(0x0018);
    out.put_i16(-1);
}

fn put_audio_fields(out: &mut Vec<u8>, sample_rate: u32, channels: u16, sample_size: u16) {
    out.put_bytes(0, 6);
    out.put_u16(1);
    out.put_bytes(0, 8);
    out.put_u16(channels);
    out.put_u16(sample_size);
    out.put_u16(0);
    out.put_u16(0);
    // 16.16 fixed point; rates above 65535 Hz do not fit and are stored as 0.
    let rate = if sample_rate <= 0xFFFF { sample_rate << 16 } else { 0 };
    out.put_u32(rate);
}

fn put_descriptor(out: &mut Vec<u8>, tag: u8, payload: &[u8]) {
    out.put_u8(tag);
    let mut len = payload.len() as u32;
    let mut bytes = [0u8; 4];
    let mut n = 0;
    loop {
        bytes[n] = (len & 0x7F) as u8;
        len >>= 7;
        n += 1;
        if len == 0 || n == 4 {
            break;
        }
    }
    for i in (0..n).rev() {
        let more = if i > 0 { 0x80 } else { 0 };
        out.put_u8(bytes[i] | more);
    }
    out.extend_from_slice(payload);
}

fn put_esds(out: &mut Vec<u8>, object_type: u8, stream_type: u8, decoder_specific: &[u8]) {
    let mut dcd = Vec::new();
    dcd.put_u8(object_type);
    dcd.put_u8((stream_type << 2) | 0x01);
    dcd.put_bytes(0, 3); // bufferSizeDB
    dcd.put_u32(0); // maxBitrate
    dcd.put_u32(0); // avgBitrate
    if !decoder_specific.is_empty() {
        put_descriptor(&mut dcd, 0x05, decoder_specific);
    }

    let mut es = Vec::new();
    es.put_u16(0); // ES_ID
    es.put_u8(0);
    put_descriptor(&mut es, 0x04, &dcd);
    put_descriptor(&mut es, 0x06, &[0x02]);

    let start = begin_full(out, b"esds", 0, 0);
    put_descriptor(out, 0x03, &es);
    end(out, start);
}

fn encode_ftyp(out: &mut Vec<u8>, ftyp: &FileType) {
    let start = begin(out, b"ftyp");
    out.extend_from_slice(&ftyp.major_brand);
    out.put_u32(ftyp.minor_version);
    for b in &ftyp.compatible_brands {
        out.extend_from_slice(b);
    }
    end(out, start);
}

fn encode_moov(out: &mut Vec<u8>, movie: &Movie) {
    let moov = begin(out, b"moov");

    let mvhd = begin_full(out, b"mvhd", 1, 0);
    out.put_u64(0);
    out.put_u64(0);
    out.put_u32(movie.timescale);
    out.put_u64(movie.duration);
    out.put_u32(0x0001_0000); // rate 1.0
    out.put_u16(0x0100); // volume 1.0
    out.put_bytes(0, 10);
    put_matrix(out);
    out.put_bytes(0, 24);
    let next_track_id = movie.tracks.iter().map(|t| t.track_id).max().unwrap_or(0) + 1;
    out.put_u32(next_track_id);
    end(out, mvhd);

    for track in &movie.tracks {
        encode_trak(out, track, movie);
    }

    let mvex = begin(out, b"mvex");
    if let Some(d) = movie.fragment_duration {
        let mehd = begin_full(out, b"mehd", 1, 0);
        out.put_u64(d);
        end(out, mehd);
    }
    for track in &movie.tracks {
        let trex = begin_full(out, b"trex", 0, 0);
        out.put_u32(track.track_id);
        out.put_u32(1);
        out.put_u32(0);
        out.put_u32(0);
        out.put_u32(0);
        end(out, trex);
    }
    end(out, mvex);

    if !movie.tags.is_empty() {
        encode_udta(out, &movie.tags);
    }

    end(out, moov);
}

fn encode_trak(out: &mut Vec<u8>, track: &TrackHeader, movie: &Movie) {
    let kind = track.entry.kind();
    let trak = begin(out, b"trak");

    let tkhd = begin_full(out, b"tkhd", 1, 0x03);
    out.put_u64(0);
    out.put_u64(0);
    out.put_u32(track.track_id);
    out.put_u32(0);
    let movie_duration = crate::foundation::math::rescale(
        track.duration,
        track.timescale,
        movie.timescale,
    );
    out.put_u64(movie_duration);
    out.put_bytes(0, 8);
    out.put_u16(0); // layer
    out.put_u16(0); // alternate_group
    out.put_u16(if kind == MediaKind::Audio { 0x0100 } else { 0 });
    out.put_u16(0);
    put_matrix(out);
    let (w, h) = match &track.entry {
        SampleEntry::Avc1 { width, height, .. } | SampleEntry::Mp4v { width, height, .. } => {
            (u32::from(*width), u32::from(*height))
        }
        _ => (0, 0),
    };
    out.put_u32(w << 16);
    out.put_u32(h << 16);
    end(out, tkhd);

    let mdia = begin(out, b"mdia");
    let mdhd = begin_full(out, b"mdhd", 1, 0);
    out.put_u64(0);
    out.put_u64(0);
    out.put_u32(track.timescale);
    out.put_u64(track.duration);
    out.put_u16(0x55C4); // "und"
    out.put_u16(0);
    end(out, mdhd);

    let (handler, name): (&FourCc, &[u8]) = match kind {
        MediaKind::Video => (b"vide", b"VideoHandler\0"),
        MediaKind::Audio => (b"soun", b"SoundHandler\0"),
    };
    let hdlr = begin_full(out, b"hdlr", 0, 0);
    out.put_u32(0);
    out.extend_from_slice(handler);
    out.put_bytes(0, 12);
    out.extend_from_slice(name);
    end(out, hdlr);

    let minf = begin(out, b"minf");
    match kind {
        MediaKind::Video => {
            let vmhd = begin_full(out, b"vmhd", 0, 1);
            out.put_bytes(0, 8);
            end(out, vmhd);
        }
        MediaKind::Audio => {
            let smhd = begin_full(out, b"smhd", 0, 0);
            out.put_u32(0);
            end(out, smhd);
        }
    }
    let dinf = begin(out, b"dinf");
    let dref = begin_full(out, b"dref", 0, 0);
    out.put_u32(1);
    let url = begin_full(out, b"url ", 0, 1);
    end(out, url);
    end(out, dref);
    end(out, dinf);

    let stbl = begin(out, b"stbl");
    let stsd = begin_full(out, b"stsd", 0, 0);
    out.put_u32(1);
    track.entry.encode(out);
    end(out, stsd);
    for fourcc in [b"stts", b"stsc", b"stco"] {
        let b = begin_full(out, fourcc, 0, 0);
        out.put_u32(0);
        end(out, b);
    }
    let stsz = begin_full(out, b"stsz", 0, 0);
    out.put_u32(0);
    out.put_u32(0);
    end(out, stsz);
    end(out, stbl);

    end(out, minf);
    end(out, mdia);
    end(out, trak);
}

fn encode_udta(out: &mut Vec<u8>, tags: &[(String, String)]) {
    let udta = begin(out, b"udta");
    let meta = begin_full(out, b"meta", 0, 0);

    let hdlr = begin_full(out, b"hdlr", 0, 0);
    out.put_u32(0);
    out.extend_from_slice(b"mdir");
    out.extend_from_slice(b"appl");
    out.put_bytes(0, 8);
    out.put_u8(0);
    end(out, hdlr);

    let ilst = begin(out, b"ilst");
    for (name, value) in tags {
        let item = begin(out, b"----");
        let mean = begin_full(out, b"mean", 0, 0);
        out.extend_from_slice(b"com.apple.iTunes");
        end(out, mean);
        let n = begin_full(out, b"name", 0, 0);
        out.extend_from_slice(name.as_bytes());
        end(out, n);
        let data = begin(out, b"data");
        out.put_u32(1); // UTF-8
        out.put_u32(0);
        out.extend_from_slice(value.as_bytes());
        end(out, data);
        end(out, item);
    }
    end(out, ilst);

    end(out, meta);
    end(out, udta);
}

fn encode_moof(out: &mut Vec<u8>, fragment: &Fragment) {
    let moof = begin(out, b"moof");
    let mfhd = begin_full(out, b"mfhd", 0, 0);
    out.put_u32(fragment.sequence);
    end(out, mfhd);

    let mut offset_fields = Vec::with_capacity(fragment.tracks.len());
    for traf in &fragment.tracks {
        let t = begin(out, b"traf");
        let tfhd = begin_full(out, b"tfhd", 0, 0x02_0000); // default-base-is-moof
        out.put_u32(traf.track_id);
        end(out, tfhd);

        let tfdt = begin_full(out, b"tfdt", 1, 0);
        out.put_u64(traf.base_decode_time);
        end(out, tfdt);

        // data-offset | duration | size | flags | composition offset
        let trun = begin_full(out, b"trun", 1, 0x0000_0F01);
        out.put_u32(traf.samples.len() as u32);
        offset_fields.push(out.len());
        out.put_i32(0);
        for s in &traf.samples {
            out.put_u32(s.duration);
            out.put_u32(s.size);
            out.put_u32(if s.is_sync {
                SAMPLE_FLAGS_SYNC
            } else {
                SAMPLE_FLAGS_NON_SYNC
            });
            out.put_i32(s.cts_offset);
        }
        end(out, trun);
        end(out, t);
    }
    end(out, moof);

    let moof_len = (out.len() - moof) as u64;
    let mut data_offset = moof_len + 8;
    for (field, traf) in offset_fields.into_iter().zip(&fragment.tracks) {
        let v = i32::try_from(data_offset).unwrap_or(i32::MAX);
        out[field..field + 4].copy_from_slice(&v.to_be_bytes());
        data_offset += traf.data_len();
    }
}

fn encode_mdat(out: &mut Vec<u8>, payloads: &[Bytes]) {
    let payload_len: u64 = payloads.iter().map(|p| p.len() as u64).sum();
    if payload_len + 8 > u64::from(u32::MAX) {
        out.put_u32(1);
        out.extend_from_slice(b"mdat");
        out.put_u64(payload_len + 16);
    } else {
        out.put_u32((payload_len + 8) as u32);
        out.extend_from_slice(b"mdat");
    }
    for p in payloads {
        out.extend_from_slice(p);
    }
}

#[cfg(test)]
#[path = "../../tests/unit/mp4/boxes.rs"]
mod tests;
