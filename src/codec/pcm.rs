use std::ops::ControlFlow;

use bytes::{BufMut as _, Bytes, BytesMut};
use tokio::sync::mpsc::UnboundedSender;

use crate::codec::worker::{CodecCore, WorkerMsg};
use crate::codec::{AudioDecoder, AudioEncoder, AudioEncoderConfig, DecoderEvent, EncoderEvent};
use crate::foundation::error::{CodecState, MontageResult};
use crate::media::chunk::{AudioTrackConfig, ChunkKind, EncodedChunk, MediaKind, TrackConfig};
use crate::media::frame::AudioData;

pub const CODEC: &str = "pcm-s16";

/// Interleaved signed 16-bit little-endian PCM. Every chunk is a sync sample.
pub struct PcmEncoder {
    core: CodecCore<AudioData>,
    events: UnboundedSender<EncoderEvent>,
    format: Option<(u32, u16)>,
}

impl PcmEncoder {
    pub fn new(events: UnboundedSender<EncoderEvent>) -> Self {
        Self {
            core: CodecCore::new(CODEC),
            events,
            format: None,
        }
    }
}

impl AudioEncoder for PcmEncoder {
    fn configure(&mut self, config: &AudioEncoderConfig) -> MontageResult<()> {
        if config.codec != CODEC {
            return Err(self
                .core
                .error(format!("cannot configure for codec '{}'", config.codec), None));
        }
        if config.sample_rate == 0 || config.channels == 0 {
            return Err(self
                .core
                .error("sample rate and channel count must be non-zero", None));
        }
        let (sample_rate, channels) = (config.sample_rate, config.channels);
        let events = self.events.clone();
        let mut sent_config = false;

        self.core.start("encode", move |msg, _depth| {
            let event = match msg {
                WorkerMsg::Input(data) => {
                    let config = (!sent_config).then(|| {
                        TrackConfig::Audio(AudioTrackConfig {
                            codec: CODEC.to_owned(),
                            sample_rate,
                            channels,
                            description: Bytes::new(),
                        })
                    });
                    sent_config = true;
                    let chunk = EncodedChunk {
                        kind: ChunkKind::Key,
                        timestamp: data.timestamp,
                        duration: data.duration,
                        data: f32_to_s16le(&data.samples),
                    };
                    EncoderEvent::Chunk { chunk, config }
                }
                WorkerMsg::Flush => EncoderEvent::Flushed,
            };
            match events.send(event) {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            }
        })?;
        self.format = Some((sample_rate, channels));
        Ok(())
    }

    fn encode(&mut self, data: AudioData) -> MontageResult<()> {
        if let Some((rate, channels)) = self.format
            && (data.sample_rate != rate || data.channels != channels)
        {
            return Err(self.core.error(
                format!(
                    "audio is {} Hz / {} ch, encoder is configured for {rate} Hz / {channels} ch",
                    data.sample_rate, data.channels
                ),
                Some(data.timestamp),
            ));
        }
        let ts = data.timestamp;
        self.core.submit(data, ts)
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

pub struct PcmDecoder {
    core: CodecCore<EncodedChunk>,
    events: UnboundedSender<DecoderEvent>,
}

impl PcmDecoder {
    pub fn new(events: UnboundedSender<DecoderEvent>) -> Self {
        Self {
            core: CodecCore::new(CODEC),
            events,
        }
    }
}

impl AudioDecoder for PcmDecoder {
    fn configure(&mut self, config: &AudioTrackConfig) -> MontageResult<()> {
        if config.codec != CODEC {
            return Err(self
                .core
                .error(format!("cannot decode codec '{}'", config.codec), None));
        }
        if config.sample_rate == 0 || config.channels == 0 {
            return Err(self
                .core
                .error("sample rate and channel count must be non-zero", None));
        }
        let (sample_rate, channels) = (config.sample_rate, config.channels);
        let events = self.events.clone();
        self.core.start("decode", move |msg, _depth| {
            let event = match msg {
                WorkerMsg::Input(chunk) => {
                    let mut samples = s16le_to_f32(&chunk.data);
                    samples.truncate(samples.len() - samples.len() % usize::from(channels));
                    DecoderEvent::Audio(AudioData {
                        timestamp: chunk.timestamp,
                        duration: chunk.duration,
                        sample_rate,
                        channels,
                        samples,
                    })
                }
                WorkerMsg::Flush => DecoderEvent::Flushed(MediaKind::Audio),
            };
            match events.send(event) {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            }
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

pub(crate) fn f32_to_s16le(samples: &[f32]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)).round() as i16;
        out.put_i16_le(v);
    }
    out.freeze()
}

pub(crate) fn s16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / f32::from(i16::MAX))
        .collect()
}
