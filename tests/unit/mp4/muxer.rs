use std::collections::HashMap;

use super::*;
use crate::media::chunk::{AudioTrackConfig, VideoTrackConfig};
use crate::mp4::reader::{parse_moof, parse_moov, read_box_header};

fn video_config() -> TrackConfig {
    TrackConfig::Video(VideoTrackConfig {
        codec: "jpeg".to_owned(),
        width: 64,
        height: 32,
        description: Bytes::new(),
    })
}

fn audio_config() -> TrackConfig {
    TrackConfig::Audio(AudioTrackConfig {
        codec: "pcm-s16".to_owned(),
        sample_rate: 48_000,
        channels: 2,
        description: Bytes::new(),
    })
}

fn opts(video: bool, audio: bool) -> MuxerOptions {
    MuxerOptions {
        tracks: TrackSet { video, audio },
        fragment_duration: 1_000_000,
        tags: vec![("encoder".to_owned(), "montage".to_owned())],
        duration_hint: Some(2_000_000),
    }
}

fn sample(dts: i64, duration: i64, is_sync: bool, byte: u8) -> Sample {
    Sample {
        dts,
        cts: dts,
        duration,
        is_sync,
        data: Bytes::from(vec![byte; 4]),
    }
}

fn top_level(bytes: &[u8]) -> Vec<([u8; 4], usize, usize)> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let h = read_box_header(&bytes[pos..]).unwrap().unwrap();
        let size = h.size.unwrap() as usize;
        out.push((h.fourcc, pos, size));
        pos += size;
    }
    out
}

#[test]
fn nothing_is_flushable_before_the_first_fragment() {
    let mut mux = Mp4Muxer::new(opts(true, true)).unwrap();
    mux.add_track(&video_config()).unwrap();
    assert!(!mux.header_written());
    mux.add_track(&audio_config()).unwrap();
    assert!(mux.header_written());
    assert!(mux.take_flushable().is_none());

    mux.add_sample(MediaKind::Video, sample(0, 40_000, true, 1)).unwrap();
    assert!(mux.take_flushable().is_none());

    // The next keyframe cuts the pending samples into the first fragment.
    mux.add_sample(MediaKind::Video, sample(40_000, 40_000, true, 2)).unwrap();
    let bytes = mux.take_flushable().unwrap();
    let kinds: Vec<_> = top_level(&bytes).into_iter().map(|(f, _, _)| f).collect();
    assert_eq!(kinds, vec![*b"ftyp", *b"moov", *b"moof", *b"mdat"]);
    assert!(mux.take_flushable().is_none());
    assert_eq!(mux.stats().fragments, 1);
    assert_eq!(mux.stats().boxes_flushed, 4);
}

#[test]
fn track_errors_are_classified() {
    let mut mux = Mp4Muxer::new(opts(true, false)).unwrap();
    let err = mux.add_track(&audio_config()).unwrap_err();
    assert!(matches!(err, MontageError::Config(_)));

    let err = mux
        .add_sample(MediaKind::Video, sample(0, 1, true, 0))
        .unwrap_err();
    assert!(matches!(err, MontageError::Sequence(_)));

    mux.add_track(&video_config()).unwrap();
    let err = mux.add_track(&video_config()).unwrap_err();
    assert!(matches!(err, MontageError::Sequence(_)));

    mux.add_sample(MediaKind::Video, sample(100, 1, true, 0)).unwrap();
    let err = mux
        .add_sample(MediaKind::Video, sample(99, 1, false, 0))
        .unwrap_err();
    assert!(err.to_string().starts_with("sequencing error:"));
}

#[test]
fn finish_without_tracks_fails() {
    let mut mux = Mp4Muxer::new(opts(false, true)).unwrap();
    assert!(matches!(mux.finish(), Err(MontageError::Sequence(_))));
}

#[test]
fn finish_tolerates_a_missing_expected_track() {
    let mut mux = Mp4Muxer::new(opts(true, true)).unwrap();
    mux.add_track(&video_config()).unwrap();
    mux.add_sample(MediaKind::Video, sample(0, 40_000, true, 7)).unwrap();
    mux.finish().unwrap();
    assert!(mux.is_finished());

    let bytes = mux.take_flushable().unwrap();
    let boxes = top_level(&bytes);
    let (_, pos, size) = boxes[1];
    let movie = parse_moov(&bytes[pos + 8..pos + size]).unwrap();
    assert_eq!(movie.tracks.len(), 1);
    assert!(mux.add_sample(MediaKind::Video, sample(40_000, 1, true, 0)).is_err());
}

#[test]
fn audio_only_fragments_follow_the_fragment_duration() {
    let mut mux = Mp4Muxer::new(opts(false, true)).unwrap();
    mux.add_track(&audio_config()).unwrap();
    for i in 0..25 {
        mux.add_sample(MediaKind::Audio, sample(i * 100_000, 100_000, true, i as u8))
            .unwrap();
    }
    mux.finish().unwrap();
    assert_eq!(mux.stats().fragments, 3);
    assert_eq!(mux.stats().audio_samples, 25);
}

#[test]
fn written_stream_parses_back_into_the_same_samples() {
    let mut mux = Mp4Muxer::new(opts(true, true)).unwrap();
    mux.add_track(&video_config()).unwrap();
    mux.add_track(&audio_config()).unwrap();
    for i in 0..6i64 {
        mux.add_sample(
            MediaKind::Video,
            sample(i * 40_000, 40_000, i % 3 == 0, 10 + i as u8),
        )
        .unwrap();
        mux.add_sample(MediaKind::Audio, sample(i * 40_000, 40_000, true, 100 + i as u8))
            .unwrap();
    }
    mux.finish().unwrap();
    let bytes = mux.take_flushable().unwrap();

    let boxes = top_level(&bytes);
    let (_, pos, size) = boxes[1];
    let movie = parse_moov(&bytes[pos + 8..pos + size]).unwrap();
    assert!(movie.fragmented);
    assert_eq!(movie.duration, 2_000_000);
    assert_eq!(movie.tags, vec![("encoder".to_owned(), "montage".to_owned())]);
    assert_eq!(movie.tracks[0].config, video_config());
    assert_eq!(movie.tracks[1].config, audio_config());

    let mut next = HashMap::new();
    let mut video = Vec::new();
    for &(fourcc, pos, size) in &boxes {
        if &fourcc != b"moof" {
            continue;
        }
        for run in parse_moof(&bytes[pos + 8..pos + size], pos as u64, &movie, &mut next).unwrap() {
            if run.track_id == 1 {
                video.extend(run.samples);
            }
        }
    }
    assert_eq!(video.len(), 6);
    for (i, s) in video.iter().enumerate() {
        assert_eq!(s.dts, i as u64 * 40_000);
        assert_eq!(s.is_sync, i % 3 == 0);
        let start = s.offset as usize;
        assert_eq!(&bytes[start..start + 4], &[10 + i as u8; 4]);
    }
}
