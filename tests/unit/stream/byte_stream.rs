use std::time::Duration;

use super::*;
use crate::media::chunk::{AudioTrackConfig, MediaKind, TrackConfig};
use crate::mp4::reader::read_box_header;
use crate::mp4::{MuxerOptions, Sample, TrackSet};
use crate::stream::scheduler::TickScheduler;

fn audio_muxer() -> Arc<Mutex<Mp4Muxer>> {
    let mut mux = Mp4Muxer::new(MuxerOptions {
        tracks: TrackSet {
            video: false,
            audio: true,
        },
        fragment_duration: 200_000,
        tags: Vec::new(),
        duration_hint: None,
    })
    .unwrap();
    mux.add_track(&TrackConfig::Audio(AudioTrackConfig {
        codec: "pcm-s16".to_owned(),
        sample_rate: 1000,
        channels: 1,
        description: Bytes::new(),
    }))
    .unwrap();
    Arc::new(Mutex::new(mux))
}

fn push(mux: &Arc<Mutex<Mp4Muxer>>, dts: i64) {
    mux.lock()
        .unwrap()
        .add_sample(
            MediaKind::Audio,
            Sample {
                dts,
                cts: dts,
                duration: 100_000,
                is_sync: true,
                data: Bytes::from(vec![0u8; 200]),
            },
        )
        .unwrap();
}

fn top_level_boxes(mut data: &[u8]) -> Vec<[u8; 4]> {
    let mut out = Vec::new();
    while let Some(h) = read_box_header(data).unwrap() {
        let size = h.size.unwrap() as usize;
        out.push(h.fourcc);
        data = &data[size..];
    }
    out
}

struct Harness {
    stream: ByteStream,
    supervisor: Supervisor,
    finished: OnceSignal,
    _scheduler: TickScheduler,
}

fn harness(mux: &Arc<Mutex<Mp4Muxer>>) -> Harness {
    let scheduler = TickScheduler::start(Duration::from_millis(2));
    let supervisor = Supervisor::new();
    let finished = OnceSignal::new();
    let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    spawn_flusher(
        Arc::clone(mux),
        scheduler.subscribe(Duration::from_millis(4)),
        tx,
        supervisor.clone(),
        finished.clone(),
    );
    Harness {
        stream: ByteStream::new(rx, supervisor.clone()),
        supervisor,
        finished,
        _scheduler: scheduler,
    }
}

#[tokio::test]
async fn nothing_is_emitted_before_the_first_fragment() {
    let mux = audio_muxer();
    let mut h = harness(&mux);
    push(&mux, 0);
    let early = tokio::time::timeout(Duration::from_millis(50), h.stream.next_chunk()).await;
    assert!(early.is_err(), "init segment must wait for a moof");

    push(&mux, 100_000);
    push(&mux, 200_000);
    let chunk = tokio::time::timeout(Duration::from_secs(2), h.stream.next_chunk())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        top_level_boxes(&chunk),
        vec![*b"ftyp", *b"moov", *b"moof", *b"mdat"]
    );
}

#[tokio::test]
async fn stream_closes_after_the_muxer_finishes() {
    let mux = audio_muxer();
    let h = harness(&mux);
    for i in 0..5 {
        push(&mux, i * 100_000);
    }
    mux.lock().unwrap().finish().unwrap();
    h.finished.fire();

    let all = tokio::time::timeout(Duration::from_secs(2), h.stream.read_to_end())
        .await
        .unwrap()
        .unwrap();
    let boxes = top_level_boxes(&all);
    assert_eq!(&boxes[..2], &[*b"ftyp", *b"moov"]);
    assert_eq!(boxes.iter().filter(|b| *b == b"moof").count(), 3);
    assert_eq!(mux.lock().unwrap().stats().bytes_flushed, all.len() as u64);
}

#[tokio::test]
async fn failure_is_the_last_item() {
    let mux = audio_muxer();
    let mut h = harness(&mux);
    push(&mux, 0);
    push(&mux, 300_000);
    h.supervisor.fail(MontageError::sequence("boom"));

    let mut items = Vec::new();
    while let Some(item) = tokio::time::timeout(Duration::from_secs(2), h.stream.next_chunk())
        .await
        .unwrap()
    {
        items.push(item);
    }
    let last = items.pop().unwrap();
    assert!(matches!(last, Err(MontageError::Sequence(_))));
    assert!(items.iter().all(|i| i.is_ok()));
}

#[tokio::test]
async fn dropping_the_stream_cancels_the_composition() {
    let mux = audio_muxer();
    let h = harness(&mux);
    let sup = h.supervisor.clone();
    drop(h.stream);
    assert!(sup.is_cancelled());
}

#[tokio::test]
async fn stop_requests_a_graceful_end() {
    let mux = audio_muxer();
    let h = harness(&mux);
    h.stream.stop();
    assert!(h.supervisor.stop_requested());
    assert!(!h.supervisor.is_cancelled());
    h.stream.cancel();
    assert!(h.supervisor.is_cancelled());
}
