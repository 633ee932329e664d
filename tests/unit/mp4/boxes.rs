use super::*;

fn encoded(b: &Mp4Box) -> Vec<u8> {
    let mut out = Vec::new();
    b.encode(&mut out);
    out
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn ftyp_lists_major_and_compatible_brands() {
    let out = encoded(&Mp4Box::Ftyp(FileType::default()));
    assert_eq!(out.len(), 8 + 4 + 4 + 4 * 4);
    assert_eq!(&out[0..4], &(out.len() as u32).to_be_bytes());
    assert_eq!(&out[4..8], b"ftyp");
    assert_eq!(&out[8..12], b"isom");
    assert_eq!(&out[16..20], b"isom");
    assert_eq!(&out[28..32], b"mp41");
}

#[test]
fn jpeg_track_maps_to_mp4v_with_jpeg_object_type() {
    let config = TrackConfig::Video(VideoTrackConfig {
        codec: "jpeg".to_owned(),
        width: 320,
        height: 240,
        description: Bytes::new(),
    });
    let entry = SampleEntry::from_track_config(&config).unwrap();
    assert!(matches!(
        entry,
        SampleEntry::Mp4v {
            width: 320,
            height: 240,
            object_type: 0x6C,
            ..
        }
    ));
    assert_eq!(entry.codec_string(), "jpeg");
    assert_eq!(entry.kind(), MediaKind::Video);

    let movie = Movie {
        timescale: 1_000_000,
        duration: 0,
        fragment_duration: None,
        tracks: vec![TrackHeader {
            track_id: 1,
            timescale: 1_000_000,
            duration: 0,
            entry,
        }],
        tags: Vec::new(),
    };
    let out = encoded(&Mp4Box::Moov(movie));
    assert!(contains(&out, b"mp4v"));
    assert!(contains(&out, b"esds"));
    // DecoderConfigDescriptor: tag 0x04, length, then the object type.
    assert!(out.windows(3).any(|w| w[0] == 0x04 && w[2] == 0x6C));
    assert!(contains(&out, b"trex"));
    assert!(!contains(&out, b"mehd"));
}

#[test]
fn codec_strings_follow_the_sample_entries() {
    let avc = SampleEntry::Avc1 {
        width: 1,
        height: 1,
        avcc: Bytes::from_static(&[1, 0x64, 0x00, 0x1f, 0xff]),
    };
    assert_eq!(avc.codec_string(), "avc1.64001f");

    let aac = SampleEntry::Mp4a {
        sample_rate: 48_000,
        channels: 2,
        object_type: 0x40,
        decoder_specific: Bytes::from_static(&[0x11, 0x90]),
    };
    assert_eq!(aac.codec_string(), "mp4a.40.2");

    let pcm = SampleEntry::from_track_config(&TrackConfig::Audio(AudioTrackConfig {
        codec: "pcm-s16".to_owned(),
        sample_rate: 48_000,
        channels: 2,
        description: Bytes::new(),
    }))
    .unwrap();
    assert_eq!(pcm.codec_string(), "pcm-s16");

    let err = SampleEntry::from_track_config(&TrackConfig::Audio(AudioTrackConfig {
        codec: "opus".to_owned(),
        sample_rate: 48_000,
        channels: 2,
        description: Bytes::new(),
    }))
    .unwrap_err();
    assert!(err.to_string().contains("opus"));
}

#[test]
fn moof_data_offset_points_at_the_mdat_payload() {
    let fragment = Fragment {
        sequence: 1,
        tracks: vec![
            TrackFragment {
                track_id: 1,
                base_decode_time: 0,
                samples: vec![
                    FragmentSample {
                        duration: 10,
                        size: 3,
                        is_sync: true,
                        cts_offset: 0,
                    },
                    FragmentSample {
                        duration: 10,
                        size: 2,
                        is_sync: false,
                        cts_offset: 0,
                    },
                ],
            },
            TrackFragment {
                track_id: 2,
                base_decode_time: 0,
                samples: vec![FragmentSample {
                    duration: 20,
                    size: 4,
                    is_sync: true,
                    cts_offset: 0,
                }],
            },
        ],
    };
    let mut out = encoded(&Mp4Box::Moof(fragment));
    let moof_len = out.len();
    Mp4Box::Mdat(vec![
        Bytes::from_static(b"AAA"),
        Bytes::from_static(b"BB"),
        Bytes::from_static(b"CCCC"),
    ])
    .encode(&mut out);

    // Locate each trun and read its data_offset (after the full header and sample count).
    let truns: Vec<usize> = out
        .windows(4)
        .enumerate()
        .filter(|(_, w)| *w == b"trun")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(truns.len(), 2);
    let read_offset = |at: usize| {
        let p = at + 4 + 4 + 4;
        i32::from_be_bytes([out[p], out[p + 1], out[p + 2], out[p + 3]]) as usize
    };
    assert_eq!(read_offset(truns[0]), moof_len + 8);
    assert_eq!(&out[read_offset(truns[0])..read_offset(truns[0]) + 3], b"AAA");
    assert_eq!(&out[read_offset(truns[1])..read_offset(truns[1]) + 4], b"CCCC");
}

#[test]
fn tags_are_written_as_freeform_items() {
    let movie = Movie {
        timescale: 1_000_000,
        duration: 5_000_000,
        fragment_duration: Some(5_000_000),
        tracks: Vec::new(),
        tags: vec![("title".to_owned(), "demo".to_owned())],
    };
    let out = encoded(&Mp4Box::Moov(movie));
    assert!(contains(&out, b"mehd"));
    assert!(contains(&out, b"ilst"));
    assert!(contains(&out, b"title"));
    assert!(contains(&out, b"demo"));
}
