use super::*;

#[test]
fn video_frame_rejects_mismatched_buffer() {
    assert!(VideoFrame::new(0, 10, 2, 2, vec![0; 15]).is_err());
    assert!(VideoFrame::new(0, 10, 0, 2, vec![]).is_err());
    let f = VideoFrame::new(5, 10, 2, 2, vec![0; 16]).unwrap();
    assert!(f.contains(5));
    assert!(f.contains(14));
    assert!(!f.contains(15));
}

#[test]
fn retimed_frames_share_pixels() {
    let f = VideoFrame::solid(4, 4, Rgba8Premul::from_straight_rgba(255, 0, 0, 255)).unwrap();
    let g = f.with_timing(100, 33);
    assert!(Arc::ptr_eq(&f.data, &g.data));
    assert_eq!(g.end(), 133);
}

#[test]
fn silence_matches_tick_span() {
    let a = AudioData::silence(0, 33_333, 48_000, 2);
    let b = AudioData::silence(33_333, 33_333, 48_000, 2);
    assert_eq!(a.frames() + b.frames(), 3_199);
    assert_eq!(a.samples.len(), a.frames() * 2);
}

#[test]
fn audio_duration_follows_frame_count() {
    let a = AudioData::new(0, 48_000, 2, vec![0.0; 96_000]).unwrap();
    assert_eq!(a.duration, 1_000_000);
    assert!(AudioData::new(0, 48_000, 2, vec![0.0; 3]).is_err());
}
