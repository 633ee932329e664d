use super::*;
use crate::foundation::core::Rgba8Premul;
use crate::media::chunk::ChunkKind;
use tokio::sync::mpsc::unbounded_channel;

fn video_config(width: u32, height: u32) -> VideoEncoderConfig {
    VideoEncoderConfig {
        codec: "jpeg".to_owned(),
        width,
        height,
        framerate: Fps::default(),
        bitrate: None,
        quality: 90,
    }
}

#[test]
fn factory_rejects_unknown_codecs() {
    let (tx, _rx) = unbounded_channel();
    let err = SoftwareCodecs.video_encoder("avc1.42001f", tx).err().unwrap();
    assert!(err.to_string().contains("configuration error:"));
    let (tx, _rx) = unbounded_channel();
    assert!(SoftwareCodecs.audio_decoder("mp4a.40.2", tx).is_err());
}

#[tokio::test]
async fn jpeg_output_decodes_back_to_the_same_picture() {
    let (tx, mut rx) = unbounded_channel();
    let mut enc = SoftwareCodecs.video_encoder("jpeg", tx).unwrap();
    enc.configure(&video_config(16, 8)).unwrap();
    let red = VideoFrame::solid(16, 8, Rgba8Premul::from_straight_rgba(255, 0, 0, 255))
        .unwrap()
        .with_timing(0, 33_333);
    enc.encode(red, EncodeOptions { key_frame: true }).unwrap();
    enc.flush().unwrap();

    let EncoderEvent::Chunk { chunk, config } = rx.recv().await.unwrap() else {
        panic!("expected a chunk");
    };
    assert_eq!(chunk.kind, ChunkKind::Key);
    assert_eq!(chunk.duration, 33_333);
    let Some(TrackConfig::Video(cfg)) = config else {
        panic!("first chunk must carry the track config");
    };
    assert_eq!((cfg.width, cfg.height), (16, 8));
    assert!(matches!(rx.recv().await.unwrap(), EncoderEvent::Flushed));

    let (dtx, mut drx) = unbounded_channel();
    let mut dec = SoftwareCodecs.video_decoder("jpeg", dtx).unwrap();
    dec.configure(&cfg).unwrap();
    dec.decode(chunk).unwrap();
    let DecoderEvent::Video(frame) = drx.recv().await.unwrap() else {
        panic!("expected a frame");
    };
    assert_eq!((frame.width, frame.height), (16, 8));
    assert!(frame.data[0] > 240 && frame.data[1] < 16 && frame.data[3] == 255);
    enc.close();
    dec.close();
}

#[test]
fn encoding_requires_a_configured_open_encoder() {
    let (tx, _rx) = unbounded_channel();
    let mut enc = JpegEncoder::new(tx);
    let frame = VideoFrame::solid(4, 4, Rgba8Premul::transparent()).unwrap();
    let err = enc
        .encode(frame.clone(), EncodeOptions::default())
        .unwrap_err();
    let MontageError::Codec { diagnostics, .. } = err else {
        panic!("expected codec error");
    };
    assert_eq!(diagnostics.state, CodecState::Unconfigured);
    assert_eq!(diagnostics.codec, "jpeg");

    enc.configure(&video_config(8, 8)).unwrap();
    let err = enc
        .encode(frame.clone(), EncodeOptions::default())
        .unwrap_err();
    assert!(err.to_string().contains("configured for 8x8"));

    enc.close();
    assert_eq!(enc.state(), CodecState::Closed);
    let err = enc
        .configure(&video_config(4, 4))
        .unwrap_err()
        .to_string();
    assert!(err.contains("state=closed"));
}

#[tokio::test]
async fn pcm_round_trips_within_quantization() {
    let (tx, mut rx) = unbounded_channel();
    let mut enc = SoftwareCodecs.audio_encoder("pcm-s16", tx).unwrap();
    enc.configure(&AudioEncoderConfig {
        codec: "pcm-s16".to_owned(),
        sample_rate: 8_000,
        channels: 2,
        bitrate: None,
    })
    .unwrap();
    let input = AudioData::new(0, 8_000, 2, vec![0.5, -0.5, 1.0, -1.0]).unwrap();
    enc.encode(input.clone()).unwrap();
    let EncoderEvent::Chunk { chunk, config } = rx.recv().await.unwrap() else {
        panic!("expected a chunk");
    };
    assert_eq!(chunk.data.len(), 8);
    let Some(TrackConfig::Audio(cfg)) = config else {
        panic!("missing audio config");
    };

    let mismatched = AudioData::new(0, 44_100, 2, vec![0.0; 4]).unwrap();
    assert!(enc.encode(mismatched).is_err());

    let (dtx, mut drx) = unbounded_channel();
    let mut dec = PcmDecoder::new(dtx);
    dec.configure(&cfg).unwrap();
    dec.decode(chunk).unwrap();
    let DecoderEvent::Audio(out) = drx.recv().await.unwrap() else {
        panic!("expected audio");
    };
    assert_eq!(out.channels, 2);
    for (a, b) in out.samples.iter().zip(&input.samples) {
        assert!((a - b).abs() < 1e-3);
    }
}
