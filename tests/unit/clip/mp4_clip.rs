use super::*;
use crate::clip::ClipState;
use crate::codec::SoftwareCodecs;
use crate::codec::pcm::f32_to_s16le;
use crate::media::chunk::{AudioTrackConfig, MediaKind, VideoTrackConfig};
use crate::mp4::{MuxerOptions, Mp4Muxer, Sample, TrackSet};

fn jpeg(shade: u8) -> Bytes {
    let pixels: Vec<u8> = (0..8 * 8).flat_map(|_| [shade, shade, shade]).collect();
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 95)
        .encode(&pixels, 8, 8, image::ExtendedColorType::Rgb8)
        .unwrap();
    Bytes::from(out)
}

/// `frames` pictures of 100 ms starting at `first_ts`, plus matching 100 ms audio blocks.
/// A keyframe every `gop` pictures; each fragment stores its pictures ahead of its audio.
fn movie(frames: i64, first_ts: i64, with_audio: bool, gop: i64) -> Bytes {
    let mut mux = Mp4Muxer::new(MuxerOptions {
        tracks: TrackSet {
            video: true,
            audio: with_audio,
        },
        fragment_duration: 1_000_000,
        tags: Vec::new(),
        duration_hint: Some(first_ts + frames * 100_000),
    })
    .unwrap();
    mux.add_track(&TrackConfig::Video(VideoTrackConfig {
        codec: "jpeg".to_owned(),
        width: 8,
        height: 8,
        description: Bytes::new(),
    }))
    .unwrap();
    if with_audio {
        mux.add_track(&TrackConfig::Audio(AudioTrackConfig {
            codec: "pcm-s16".to_owned(),
            sample_rate: 1000,
            channels: 1,
            description: Bytes::new(),
        }))
        .unwrap();
    }
    for i in 0..frames {
        let ts = first_ts + i * 100_000;
        mux.add_sample(
            MediaKind::Video,
            Sample {
                dts: ts,
                cts: ts,
                duration: 100_000,
                is_sync: i % gop == 0,
                data: jpeg((40 * i % 256) as u8),
            },
        )
        .unwrap();
        if with_audio {
            mux.add_sample(
                MediaKind::Audio,
                Sample {
                    dts: i * 100_000,
                    cts: i * 100_000,
                    duration: 100_000,
                    is_sync: true,
                    data: f32_to_s16le(&[0.5; 100]),
                },
            )
            .unwrap();
        }
    }
    mux.finish().unwrap();
    mux.take_flushable().unwrap()
}

fn clip(bytes: Bytes) -> Mp4Clip {
    Mp4Clip::from_bytes(bytes, Arc::new(SoftwareCodecs), Mp4ClipOptions::default())
}

#[tokio::test]
async fn meta_reports_the_container_duration() {
    let mut c = clip(movie(5, 0, true, 1));
    let meta = c.ready().await.unwrap();
    assert_eq!(meta.duration, 500_000);
    assert_eq!((meta.width, meta.height), (8, 8));
    assert_eq!(
        meta.audio,
        Some(AudioInfo {
            sample_rate: 1000,
            channels: 1
        })
    );
    // Cached on the second call.
    assert_eq!(c.ready().await.unwrap(), meta);
    c.destroy();
}

#[tokio::test]
async fn frames_follow_the_requested_time_and_stale_ones_are_dropped() {
    let mut c = clip(movie(5, 0, true, 1));
    c.ready().await.unwrap();

    let t0 = c.tick(0).await.unwrap();
    assert_eq!(t0.state, ClipState::Success);
    assert_eq!(t0.video.unwrap().timestamp, 0);

    let t1 = c.tick(50_000).await.unwrap();
    assert_eq!(t1.video.unwrap().timestamp, 0);

    let t2 = c.tick(320_000).await.unwrap();
    assert_eq!(t2.state, ClipState::Success);
    assert_eq!(t2.video.unwrap().timestamp, 300_000);
    assert!(t2.audio.iter().all(|a| a.timestamp <= 320_000));
    c.destroy();
}

#[tokio::test]
async fn audio_stored_after_video_arrives_by_its_tick() {
    let opts = Mp4ClipOptions {
        decode_audio: true,
        max_buffered_frames: 2,
    };
    let mut c = Mp4Clip::from_bytes(movie(30, 0, true, 10), Arc::new(SoftwareCodecs), opts);
    c.ready().await.unwrap();

    let mut covered = 0;
    let mut frames = 0;
    for step in 0..30 {
        let t = step * 100_000 + 50_000;
        let tick = c.tick(t).await.unwrap();
        assert_eq!(tick.state, ClipState::Success);
        assert_eq!(tick.video.unwrap().timestamp, step * 100_000);
        for a in &tick.audio {
            assert_eq!(a.timestamp, covered);
            assert!(a.timestamp <= t);
            covered = a.timestamp + a.duration;
            frames += a.frames();
        }
        assert!(covered >= t, "audio reaches {covered} at tick {t}");
    }
    assert_eq!(frames, 3_000);
    c.destroy();
}

#[tokio::test]
async fn early_time_reports_next() {
    let mut c = clip(movie(3, 200_000, false, 1));
    c.ready().await.unwrap();
    let tick = c.tick(100_000).await.unwrap();
    assert_eq!(tick.state, ClipState::Next);
    assert!(tick.video.is_none());
    let tick = c.tick(200_000).await.unwrap();
    assert_eq!(tick.state, ClipState::Success);
    c.destroy();
}

#[tokio::test]
async fn done_is_idempotent_and_carries_remaining_audio() {
    let mut c = clip(movie(3, 0, true, 1));
    c.ready().await.unwrap();
    c.tick(0).await.unwrap();

    let done = c.tick(300_000).await.unwrap();
    assert_eq!(done.state, ClipState::Done);
    let tail: usize = done.audio.iter().map(|a| a.frames()).sum();
    assert!(tail > 0);

    for t in [300_000, 400_000] {
        let again = c.tick(t).await.unwrap();
        assert_eq!(again.state, ClipState::Done);
        assert!(again.audio.is_empty());
    }
}

#[tokio::test]
async fn rollback_is_a_sequencing_error() {
    let mut c = clip(movie(2, 0, false, 1));
    c.ready().await.unwrap();
    c.tick(100).await.unwrap();
    let err = c.tick(-1).await.unwrap_err();
    assert!(matches!(err, MontageError::Sequence(_)));
    c.destroy();
}

#[tokio::test]
async fn garbage_input_fails_readiness() {
    let mut c = clip(Bytes::from_static(&[0, 0, 0, 9, b'j', b'u', b'n', b'k', 0]));
    assert!(c.ready().await.is_err());
}
