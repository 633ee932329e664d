use super::*;

#[test]
fn cursor_rejects_rollback_but_allows_repeats() {
    let mut cursor = TickCursor::default();
    cursor.advance(100).unwrap();
    cursor.advance(100).unwrap();
    let err = cursor.advance(-1).unwrap_err();
    assert!(matches!(err, MontageError::Sequence(_)));
    assert!(err.to_string().contains("rollback"));
    assert_eq!(cursor.last(), Some(100));
}

#[test]
fn cursor_done_is_sticky() {
    let mut cursor = TickCursor::default();
    assert!(!cursor.is_done());
    cursor.finish();
    cursor.advance(5).unwrap();
    assert!(cursor.is_done());
}

#[test]
fn audio_only_meta_has_no_video() {
    let meta = ClipMeta {
        duration: 1,
        width: 0,
        height: 0,
        audio: Some(AudioInfo {
            sample_rate: 48_000,
            channels: 2,
        }),
    };
    assert!(!meta.has_video());
    assert!(ClipMeta { width: 2, height: 2, ..meta }.has_video());
}
