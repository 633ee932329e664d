use std::ops::ControlFlow;

use anyhow::Context as _;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;

use crate::codec::worker::{CodecCore, WorkerMsg};
use crate::codec::{
    DecoderEvent, EncodeOptions, EncoderEvent, VideoDecoder, VideoEncoder, VideoEncoderConfig,
    diagnostics,
};
use crate::foundation::error::{CodecState, MontageError, MontageResult};
use crate::foundation::math::{flatten_premul_over_bg_to_rgb8, premultiply_rgba8_in_place};
use crate::media::chunk::{ChunkKind, EncodedChunk, MediaKind, TrackConfig, VideoTrackConfig};
use crate::media::frame::VideoFrame;

pub const CODEC: &str = "jpeg";

/// MPEG-4 object type indication registered for JPEG pictures.
pub const OBJECT_TYPE_JPEG: u8 = 0x6C;

/// Intra-only video codec: every picture is an independent baseline JPEG.
///
/// Chunks are tagged key or delta following the caller's GOP requests, so container sync-sample
/// tables mirror the requested keyframe cadence.
pub struct JpegEncoder {
    core: CodecCore<(VideoFrame, bool)>,
    events: UnboundedSender<EncoderEvent>,
    size: Option<(u32, u32)>,
}

impl JpegEncoder {
    pub fn new(events: UnboundedSender<EncoderEvent>) -> Self {
        Self {
            core: CodecCore::new(CODEC),
            events,
            size: None,
        }
    }
}

impl VideoEncoder for JpegEncoder {
    fn configure(&mut self, config: &VideoEncoderConfig) -> MontageResult<()> {
        if config.codec != CODEC {
            return Err(self
                .core
                .error(format!("cannot configure for codec '{}'", config.codec), None));
        }
        if config.width == 0 || config.height == 0 {
            return Err(self.core.error("encoder dimensions must be non-zero", None));
        }
        let quality = config.quality.clamp(1, 100);
        let (width, height) = (config.width, config.height);
        let events = self.events.clone();
        let mut sent_config = false;

        self.core.start("encode", move |msg, depth| match msg {
            WorkerMsg::Input((frame, key)) => match encode_picture(&frame, quality) {
                Ok(data) => {
                    let config = (!sent_config).then(|| {
                        TrackConfig::Video(VideoTrackConfig {
                            codec: CODEC.to_owned(),
                            width,
                            height,
                            description: Bytes::new(),
                        })
                    });
                    sent_config = true;
                    let chunk = EncodedChunk {
                        kind: if key { ChunkKind::Key } else { ChunkKind::Delta },
                        timestamp: frame.timestamp,
                        duration: frame.duration,
                        data,
                    };
                    match events.send(EncoderEvent::Chunk { chunk, config }) {
                        Ok(()) => ControlFlow::Continue(()),
                        Err(_) => ControlFlow::Break(()),
                    }
                }
                Err(e) => {
                    let err = MontageError::codec(
                        format!("jpeg encode failed: {e:#}"),
                        diagnostics(CODEC, CodecState::Configured, depth, Some(frame.timestamp)),
                    );
                    let _ = events.send(EncoderEvent::Error(err));
                    ControlFlow::Break(())
                }
            },
            WorkerMsg::Flush => match events.send(EncoderEvent::Flushed) {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            },
        })?;
        self.size = Some((width, height));
        tracing::debug!(width, height, quality, "jpeg encoder configured");
        Ok(())
    }

    fn encode(&mut self, frame: VideoFrame, opts: EncodeOptions) -> MontageResult<()> {
        if let Some((w, h)) = self.size
            && (frame.width != w || frame.height != h)
        {
            return Err(self.core.error(
                format!(
                    "frame is {}x{}, encoder is configured for {w}x{h}",
                    frame.width, frame.height
                ),
                Some(frame.timestamp),
            ));
        }
        let ts = frame.timestamp;
        self.core.submit((frame, opts.key_frame), ts)
    }

    fn flush(&mut self) -> MontageResult<()> {
        self.core.flush()
    }

    fn queue_size(&self) -> usize {
        self.core.queue_size()
    }

    fn state(&self) -> CodecState {
        self.core.state()
    }

    fn close(&mut self) {
        self.core.close();
    }
}

pub struct JpegDecoder {
    core: CodecCore<EncodedChunk>,
    events: UnboundedSender<DecoderEvent>,
}

impl JpegDecoder {
    pub fn new(events: UnboundedSender<DecoderEvent>) -> Self {
        Self {
            core: CodecCore::new(CODEC),
            events,
        }
    }
}

impl VideoDecoder for JpegDecoder {
    fn configure(&mut self, config: &VideoTrackConfig) -> MontageResult<()> {
        if config.codec != CODEC {
            return Err(self
                .core
                .error(format!("cannot decode codec '{}'", config.codec), None));
        }
        let events = self.events.clone();
        self.core.start("decode", move |msg, depth| match msg {
            WorkerMsg::Input(chunk) => match decode_picture(&chunk) {
                Ok(frame) => match events.send(DecoderEvent::Video(frame)) {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(_) => ControlFlow::Break(()),
                },
                Err(e) => {
                    let err = MontageError::codec(
                        format!("jpeg decode failed: {e}"),
                        diagnostics(CODEC, CodecState::Configured, depth, Some(chunk.timestamp)),
                    );
                    let _ = events.send(DecoderEvent::Error(err));
                    ControlFlow::Break(())
                }
            },
            WorkerMsg::Flush => match events.send(DecoderEvent::Flushed(MediaKind::Video)) {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            },
        })
    }

    fn decode(&mut self, chunk: EncodedChunk) -> MontageResult<()> {
        let ts = chunk.timestamp;
        self.core.submit(chunk, ts)
    }

    fn flush(&mut self) -> MontageResult<()> {
        self.core.flush()
    }

    fn queue_size(&self) -> usize {
        self.core.queue_size()
    }

    fn state(&self) -> CodecState {
        self.core.state()
    }

    fn close(&mut self) {
        self.core.close();
    }
}

fn encode_picture(frame: &VideoFrame, quality: u8) -> anyhow::Result<Bytes> {
    let rgb = flatten_premul_over_bg_to_rgb8(&frame.data, [0, 0, 0]);
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality)
        .encode(&rgb, frame.width, frame.height, image::ExtendedColorType::Rgb8)
        .context("encode jpeg picture")?;
    Ok(Bytes::from(out))
}

fn decode_picture(chunk: &EncodedChunk) -> MontageResult<VideoFrame> {
    let img = image::load_from_memory_with_format(&chunk.data, image::ImageFormat::Jpeg)
        .context("decode jpeg picture")?;
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut data = rgba.into_raw();
    premultiply_rgba8_in_place(&mut data);
    VideoFrame::new(chunk.timestamp, chunk.duration, width, height, data)
}
