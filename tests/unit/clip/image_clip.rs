use super::*;
use crate::clip::ClipState;

fn png(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    let pixels: Vec<u8> = (0..width * height).flat_map(|_| rgba).collect();
    let img = image::RgbaImage::from_raw(width, height, pixels).unwrap();
    let mut out = Vec::new();
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

fn gif(delays_ms: &[u32]) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let mut enc = image::codecs::gif::GifEncoder::new(&mut out);
        let frames = delays_ms.iter().enumerate().map(|(i, &ms)| {
            let shade = (i as u8).wrapping_mul(80);
            let buf = image::RgbaImage::from_pixel(4, 4, image::Rgba([shade, 0, 0, 255]));
            image::Frame::from_parts(buf, 0, 0, image::Delay::from_numer_denom_ms(ms, 1))
        });
        enc.encode_frames(frames).unwrap();
    }
    out
}

#[tokio::test]
async fn still_image_is_unbounded_and_premultiplied() {
    let mut clip = ImageClip::from_bytes(&png(3, 2, [200, 100, 50, 128])).unwrap();
    let meta = clip.ready().await.unwrap();
    assert_eq!((meta.width, meta.height, meta.duration), (3, 2, UNBOUNDED));
    assert!(meta.audio.is_none());

    let tick = clip.tick(10_000_000).await.unwrap();
    assert_eq!(tick.state, ClipState::Success);
    let frame = tick.video.unwrap();
    assert_eq!(&frame.data[..4], &[100, 50, 25, 128]);
}

#[tokio::test]
async fn rollback_fails_and_destroy_is_terminal() {
    let frame = VideoFrame::new(0, 0, 1, 1, vec![1, 2, 3, 255]).unwrap();
    let mut clip = ImageClip::from_frame(frame).unwrap();
    clip.tick(100).await.unwrap();
    let err = clip.tick(-1).await.unwrap_err();
    assert!(err.to_string().starts_with("sequencing error:"));

    clip.destroy();
    for t in [200, 200, 300] {
        assert_eq!(clip.tick(t).await.unwrap().state, ClipState::Done);
    }
}

#[tokio::test]
async fn animated_gif_loops_over_its_frame_delays() {
    let mut clip = ImageClip::from_bytes(&gif(&[50, 0])).unwrap();
    let meta = clip.ready().await.unwrap();
    assert_eq!(meta.duration, 150_000);

    let first = clip.tick(10_000).await.unwrap().video.unwrap();
    assert_eq!((first.timestamp, first.duration), (0, 50_000));
    let second = clip.tick(60_000).await.unwrap().video.unwrap();
    assert_eq!((second.timestamp, second.duration), (50_000, 100_000));
    assert_ne!(first.data, second.data);

    // Past the end of the cycle the animation starts over; time never ends an image.
    let looped = clip.tick(160_000).await.unwrap();
    assert_eq!(looped.state, ClipState::Success);
    let looped = looped.video.unwrap();
    assert_eq!(looped.timestamp, 150_000);
    assert_eq!(looped.data, first.data);
}

#[test]
fn garbage_bytes_are_rejected() {
    assert!(ImageClip::from_bytes(b"definitely not an image").is_err());
}
