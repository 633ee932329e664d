use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;

use super::*;
use crate::clip::{AudioClip, AudioClipOptions, ClipTick, ImageClip};
use crate::codec::SoftwareCodecs;
use crate::demux::{DemuxEvent, Demuxer};
use crate::foundation::core::Rgba8Premul;
use crate::media::chunk::MediaKind;
use crate::media::frame::VideoFrame;
use crate::mp4::Sample;
use crate::timeline::{AudioSettings, VideoSettings};

/// Solid-color clip that records how it is driven.
struct ProbeClip {
    duration: i64,
    frame: VideoFrame,
    ticks: Arc<AtomicUsize>,
    destroyed: Arc<AtomicBool>,
}

impl ProbeClip {
    fn new(duration: i64) -> (Self, Arc<AtomicUsize>, Arc<AtomicBool>) {
        let ticks = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicBool::new(false));
        let clip = Self {
            duration,
            frame: VideoFrame::solid(4, 4, Rgba8Premul::from_straight_rgba(200, 0, 0, 255))
                .unwrap(),
            ticks: Arc::clone(&ticks),
            destroyed: Arc::clone(&destroyed),
        };
        (clip, ticks, destroyed)
    }
}

impl Clip for ProbeClip {
    fn ready(&mut self) -> BoxFuture<'_, MontageResult<ClipMeta>> {
        let meta = ClipMeta {
            duration: self.duration,
            width: 4,
            height: 4,
            audio: None,
        };
        async move { Ok(meta) }.boxed()
    }

    fn tick(&mut self, time: i64) -> BoxFuture<'_, MontageResult<ClipTick>> {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        let tick = if time >= self.duration || self.destroyed.load(Ordering::SeqCst) {
            ClipTick::done(Default::default())
        } else {
            ClipTick::success(Some(self.frame.with_timing(time, 1)), Default::default())
        };
        async move { Ok(tick) }.boxed()
    }

    fn destroy(&mut self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

fn opts(video: bool, audio: bool) -> CombinatorOpts {
    CombinatorOpts {
        fps: Fps::new(10, 1).unwrap(),
        video: video.then(|| VideoSettings {
            width: 8,
            height: 8,
            gop_size: 5,
            ..VideoSettings::default()
        }),
        audio: audio.then(|| AudioSettings {
            sample_rate: 8000,
            channels: 1,
            ..AudioSettings::default()
        }),
        scheduler_interval_ms: 2,
        flush_interval_ms: 5,
        ..CombinatorOpts::default()
    }
}

fn combinator(video: bool, audio: bool) -> Combinator {
    Combinator::new(opts(video, audio), Arc::new(SoftwareCodecs)).unwrap()
}

fn demux(bytes: &[u8]) -> HashMap<MediaKind, Vec<Sample>> {
    let mut d = Demuxer::new();
    let mut events = d.push(bytes).unwrap();
    events.extend(d.finish().unwrap());
    let mut kinds = HashMap::new();
    let mut out: HashMap<MediaKind, Vec<Sample>> = HashMap::new();
    for e in events {
        match e {
            DemuxEvent::Ready(movie) => {
                for t in &movie.tracks {
                    kinds.insert(t.track_id, t.kind);
                }
            }
            DemuxEvent::Samples { track_id, samples } => {
                out.entry(kinds[&track_id]).or_default().extend(samples)
            }
        }
    }
    out
}

fn total(samples: &[Sample]) -> i64 {
    samples.iter().map(|s| s.duration).sum()
}

#[tokio::test]
async fn empty_timeline_fails_immediately() {
    let err = combinator(true, true).output().err().unwrap();
    assert!(matches!(err, MontageError::Sequence(ref m) if m.contains("empty timeline")));
}

#[tokio::test]
async fn unbounded_clips_need_a_duration() {
    let mut c = combinator(true, false);
    let frame = VideoFrame::solid(2, 2, Rgba8Premul::transparent()).unwrap();
    let err = c
        .add(Box::new(ImageClip::from_frame(frame.clone()).unwrap()), Placement::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MontageError::Config(_)));
    assert!(c.is_empty());

    c.add(
        Box::new(ImageClip::from_frame(frame).unwrap()),
        Placement::at(500_000).with_duration(250_000),
    )
    .await
    .unwrap();
    assert_eq!(c.len(), 1);
    assert_eq!(c.duration(), 750_000);
}

#[tokio::test]
async fn invalid_placements_destroy_the_clip() {
    let mut c = combinator(true, false);
    let (clip, _, destroyed) = ProbeClip::new(1_000_000);
    let err = c.add(Box::new(clip), Placement::at(-1)).await.unwrap_err();
    assert!(matches!(err, MontageError::Config(_)));
    assert!(destroyed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn renders_every_tick_with_periodic_keyframes() {
    let mut c = combinator(true, true);
    let (clip, ticks, destroyed) = ProbeClip::new(1_000_000);
    c.add(Box::new(clip), Placement::default()).await.unwrap();
    let bytes = c.output().unwrap().read_to_end().await.unwrap();

    let tracks = demux(&bytes);
    let video = &tracks[&MediaKind::Video];
    assert_eq!(video.len(), 10);
    let keys: Vec<i64> = video.iter().filter(|s| s.is_sync).map(|s| s.dts).collect();
    assert_eq!(keys, vec![0, 500_000]);
    assert_eq!(total(video), 1_000_000);
    // Silent placeholder audio covers the whole timeline.
    assert_eq!(total(&tracks[&MediaKind::Audio]), 1_000_000);

    // Ten frames plus the closing tick.
    assert_eq!(ticks.load(Ordering::SeqCst), 11);
    assert!(destroyed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn audio_only_timeline() {
    let mut c = combinator(false, true);
    let pcm = AudioClip::from_pcm(vec![0.25; 4000], 8000, 1, AudioClipOptions::default()).unwrap();
    c.add(Box::new(pcm), Placement::at(100_000)).await.unwrap();
    let bytes = c.output().unwrap().read_to_end().await.unwrap();
    let tracks = demux(&bytes);
    assert!(!tracks.contains_key(&MediaKind::Video));
    assert_eq!(total(&tracks[&MediaKind::Audio]), 600_000);
}

#[tokio::test]
async fn dropping_the_output_destroys_the_clips() {
    let mut c = combinator(true, false);
    let (clip, _, destroyed) = ProbeClip::new(60_000_000);
    c.add(Box::new(clip), Placement::default()).await.unwrap();
    let mut stream = c.output().unwrap();
    let first = stream.next_chunk().await.unwrap().unwrap();
    assert!(!first.is_empty());
    drop(stream);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !destroyed.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn stop_closes_the_stream_with_matching_tracks() {
    let mut c = combinator(true, true);
    let (clip, _, destroyed) = ProbeClip::new(600_000_000);
    c.add(Box::new(clip), Placement::default()).await.unwrap();
    let mut stream = c.output().unwrap();
    let mut bytes = stream.next_chunk().await.unwrap().unwrap().to_vec();
    stream.stop();
    while let Some(chunk) = stream.next_chunk().await {
        bytes.extend_from_slice(&chunk.unwrap());
    }
    assert!(destroyed.load(Ordering::SeqCst));

    let tracks = demux(&bytes);
    let video = total(&tracks[&MediaKind::Video]);
    assert!(video > 0 && video < 600_000_000);
    assert_eq!(total(&tracks[&MediaKind::Audio]), video);
}
