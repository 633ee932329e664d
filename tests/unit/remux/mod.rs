use std::collections::BTreeMap;

use super::*;
use crate::codec::SoftwareCodecs;
use crate::demux::{DemuxEvent, Demuxer};
use crate::foundation::core::{Fps, Rgba8Premul};
use crate::media::chunk::MediaKind;
use crate::mp4::MovieInfo;

fn video_cfg(fps: Fps) -> VideoEncoderConfig {
    VideoEncoderConfig {
        codec: "jpeg".to_owned(),
        width: 16,
        height: 8,
        framerate: fps,
        bitrate: None,
        quality: 80,
    }
}

fn audio_cfg() -> AudioEncoderConfig {
    AudioEncoderConfig {
        codec: "pcm-s16".to_owned(),
        sample_rate: 8000,
        channels: 1,
        bitrate: None,
    }
}

fn options(video: bool, audio: bool) -> RemuxOptions {
    RemuxOptions {
        video: video.then(|| video_cfg(Fps::new(10, 1).unwrap())),
        audio: audio.then(audio_cfg),
        fragment_duration: 500_000,
        tags: vec![("title".to_owned(), "remux".to_owned())],
        duration_hint: Some(2_500_000),
        scheduler_interval: Duration::from_millis(2),
    }
}

fn demux(bytes: &[u8]) -> (MovieInfo, BTreeMap<u32, Vec<Sample>>) {
    let mut d = Demuxer::new();
    let mut events = d.push(bytes).unwrap();
    events.extend(d.finish().unwrap());
    let mut movie = None;
    let mut tracks: BTreeMap<u32, Vec<Sample>> = BTreeMap::new();
    for e in events {
        match e {
            DemuxEvent::Ready(m) => movie = Some(m),
            DemuxEvent::Samples { track_id, samples } => {
                tracks.entry(track_id).or_default().extend(samples)
            }
        }
    }
    (movie.unwrap(), tracks)
}

fn frame(i: u64, fps: Fps) -> VideoFrame {
    let ts = fps.tick_time(i);
    let color = Rgba8Premul::from_straight_rgba((i * 10) as u8, 0, 0, 255);
    VideoFrame::solid(16, 8, color)
        .unwrap()
        .with_timing(ts, fps.tick_time(i + 1) - ts)
}

fn audio_block(i: u64, fps: Fps) -> AudioData {
    let (start, end) = (fps.tick_time(i), fps.tick_time(i + 1));
    AudioData::silence(start, end - start, 8000, 1)
}

async fn run(engine: &mut RemuxEngine, frames: u64, gop: u64, audio: bool) {
    let fps = Fps::new(10, 1).unwrap();
    for i in 0..frames {
        engine.encode_video(frame(i, fps), i % gop == 0).unwrap();
        if audio {
            engine.encode_audio(audio_block(i, fps)).unwrap();
        }
    }
    engine.finish().await.unwrap();
}

#[tokio::test]
async fn interleaved_gops_come_out_in_order() {
    let scheduler = TickScheduler::start(Duration::from_millis(1));
    let sup = Supervisor::new();
    let mut engine =
        RemuxEngine::new(options(true, true), &SoftwareCodecs, &scheduler, sup.clone()).unwrap();
    let ready = engine.tracks_ready();
    run(&mut engine, 25, 10, true).await;
    assert!(ready.is_fired());
    assert!(engine.mux_finished().is_fired());

    let bytes = engine.muxer().lock().unwrap().take_flushable().unwrap();
    let (movie, tracks) = demux(&bytes);
    assert_eq!(movie.tags, vec![("title".to_owned(), "remux".to_owned())]);

    let video_id = movie.first_of(MediaKind::Video).unwrap().track_id;
    let audio_id = movie.first_of(MediaKind::Audio).unwrap().track_id;
    let video = &tracks[&video_id];
    assert_eq!(video.len(), 25);
    assert!(video.windows(2).all(|w| w[0].dts < w[1].dts));
    let keys: Vec<i64> = video.iter().filter(|s| s.is_sync).map(|s| s.dts).collect();
    assert_eq!(keys, vec![0, 1_000_000, 2_000_000]);

    let video_total: i64 = video.iter().map(|s| s.duration).sum();
    let audio_total: i64 = tracks[&audio_id].iter().map(|s| s.duration).sum();
    assert_eq!(video_total, 2_500_000);
    assert_eq!(audio_total, video_total);
    assert!(sup.take_failure().is_none());
}

#[tokio::test]
async fn audio_only_engine_fragments_by_duration() {
    let scheduler = TickScheduler::start(Duration::from_millis(1));
    let mut engine = RemuxEngine::new(
        options(false, true),
        &SoftwareCodecs,
        &scheduler,
        Supervisor::new(),
    )
    .unwrap();
    let fps = Fps::new(10, 1).unwrap();
    for i in 0..12 {
        engine.encode_audio(audio_block(i, fps)).unwrap();
    }
    assert!(engine.encode_video(frame(0, fps), true).is_err());
    engine.finish().await.unwrap();

    let mux = engine.muxer();
    let mut mux = mux.lock().unwrap();
    assert_eq!(mux.stats().fragments, 3);
    let bytes = mux.take_flushable().unwrap();
    let (movie, tracks) = demux(&bytes);
    assert_eq!(movie.tracks.len(), 1);
    let total: i64 = tracks.values().flatten().map(|s| s.duration).sum();
    assert_eq!(total, 1_200_000);
}

#[tokio::test]
async fn unknown_codecs_are_configuration_errors() {
    let scheduler = TickScheduler::start(Duration::from_millis(5));
    let mut opts = options(true, false);
    if let Some(v) = opts.video.as_mut() {
        v.codec = "avc1.64001f".to_owned();
    }
    let err = RemuxEngine::new(opts, &SoftwareCodecs, &scheduler, Supervisor::new())
        .err()
        .unwrap();
    assert!(matches!(err, MontageError::Config(_)));

    let err = RemuxEngine::new(
        options(false, false),
        &SoftwareCodecs,
        &scheduler,
        Supervisor::new(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, MontageError::Config(_)));
}

#[tokio::test]
async fn wrong_frame_size_carries_diagnostics() {
    let scheduler = TickScheduler::start(Duration::from_millis(5));
    let mut engine =
        RemuxEngine::new(options(true, false), &SoftwareCodecs, &scheduler, Supervisor::new())
            .unwrap();
    let bad = VideoFrame::solid(4, 4, Rgba8Premul::transparent()).unwrap();
    match engine.encode_video(bad, true) {
        Err(MontageError::Codec { diagnostics, .. }) => {
            assert_eq!(diagnostics.codec, "jpeg");
            assert_eq!(diagnostics.timestamp, Some(0));
        }
        other => panic!("expected a codec error, got {other:?}"),
    }
}

#[tokio::test]
async fn cancellation_stops_the_pump() {
    let scheduler = TickScheduler::start(Duration::from_millis(1));
    let sup = Supervisor::new();
    let mut engine =
        RemuxEngine::new(options(true, false), &SoftwareCodecs, &scheduler, sup.clone()).unwrap();
    let fps = Fps::new(10, 1).unwrap();
    engine.encode_video(frame(0, fps), true).unwrap();
    sup.cancel();
    assert!(matches!(
        engine.encode_video(frame(1, fps), false),
        Err(MontageError::Cancelled)
    ));
    let res = tokio::time::timeout(Duration::from_secs(2), engine.finish())
        .await
        .unwrap();
    assert!(matches!(res, Err(MontageError::Cancelled)));
    assert!(!engine.mux_finished().is_fired());
    assert!(sup.take_failure().is_none());
}
