use super::*;
use crate::clip::ClipState;

fn ramp(frames: usize) -> Vec<f32> {
    (0..frames).map(|i| i as f32 / frames as f32).collect()
}

#[tokio::test]
async fn ticks_return_the_audio_since_the_previous_tick() {
    let mut clip = AudioClip::from_pcm(ramp(1000), 1000, 1, AudioClipOptions::default()).unwrap();
    let meta = clip.ready().await.unwrap();
    assert_eq!(meta.duration, 1_000_000);
    assert!(!meta.has_video());

    let first = clip.tick(0).await.unwrap();
    assert_eq!(first.state, ClipState::Success);
    assert!(first.audio.is_empty());

    let tick = clip.tick(250_000).await.unwrap();
    assert_eq!(tick.audio.len(), 1);
    assert_eq!(tick.audio[0].timestamp, 0);
    assert_eq!(tick.audio[0].frames(), 250);

    let tick = clip.tick(400_000).await.unwrap();
    assert_eq!(tick.audio[0].timestamp, 250_000);
    assert_eq!(tick.audio[0].samples[0], 0.25);
}

#[tokio::test]
async fn final_tick_carries_the_tail_and_done_repeats() {
    let mut clip = AudioClip::from_pcm(ramp(1000), 1000, 1, AudioClipOptions::default()).unwrap();
    clip.tick(900_000).await.unwrap();
    let last = clip.tick(1_200_000).await.unwrap();
    assert_eq!(last.state, ClipState::Done);
    assert_eq!(last.audio[0].frames(), 100);
    assert_eq!(last.audio[0].duration, 100_000);

    for t in [1_200_000, 5_000_000] {
        let tick = clip.tick(t).await.unwrap();
        assert_eq!(tick.state, ClipState::Done);
        assert!(tick.audio.is_empty());
    }
}

#[tokio::test]
async fn looping_clip_wraps_and_applies_volume() {
    let opts = AudioClipOptions {
        loop_: true,
        volume: 0.5,
    };
    let mut clip = AudioClip::from_pcm(vec![1.0, -1.0], 10, 2, opts).unwrap();
    assert_eq!(clip.ready().await.unwrap().duration, UNBOUNDED);
    let tick = clip.tick(300_000).await.unwrap();
    assert_eq!(tick.state, ClipState::Success);
    assert_eq!(tick.audio[0].samples, vec![0.5, -0.5, 0.5, -0.5, 0.5, -0.5]);
}

#[tokio::test]
async fn wav_integer_samples_are_normalized() {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut buf = Cursor::new(Vec::new());
    {
        let mut w = hound::WavWriter::new(&mut buf, spec).unwrap();
        for _ in 0..800 {
            w.write_sample(16384i16).unwrap();
            w.write_sample(-32768i16).unwrap();
        }
        w.finalize().unwrap();
    }
    let mut clip = AudioClip::from_wav(buf.get_ref(), AudioClipOptions::default()).unwrap();
    let meta = clip.ready().await.unwrap();
    assert_eq!(meta.duration, 100_000);
    assert_eq!(
        meta.audio,
        Some(AudioInfo {
            sample_rate: 8000,
            channels: 2
        })
    );
    let tick = clip.tick(100_000).await.unwrap();
    assert_eq!(tick.state, ClipState::Done);
    assert_eq!(&tick.audio[0].samples[..2], &[0.5, -1.0]);
}

#[test]
fn invalid_buffers_are_configuration_errors() {
    let err = AudioClip::from_pcm(vec![0.0; 3], 1000, 2, AudioClipOptions::default())
        .err()
        .unwrap();
    assert!(matches!(err, MontageError::Config(_)));
    assert!(AudioClip::from_wav(b"RIFF", AudioClipOptions::default()).is_err());
}
