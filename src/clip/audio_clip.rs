use std::io::Cursor;
use std::sync::Arc;

use anyhow::Context as _;
use futures::future::{self, BoxFuture};

use crate::clip::{AudioInfo, AudioPayloads, Clip, ClipMeta, ClipTick, TickCursor};
use crate::foundation::core::{UNBOUNDED, sample_to_time, time_to_sample};
use crate::foundation::error::{MontageError, MontageResult};
use crate::media::frame::AudioData;

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AudioClipOptions {
    #[serde(rename = "loop")]
    pub loop_: bool,
    pub volume: f32,
}

impl Default for AudioClipOptions {
    fn default() -> Self {
        Self {
            loop_: false,
            volume: 1.0,
        }
    }
}

/// In-memory PCM served in tick-sized slices.
pub struct AudioClip {
    samples: Arc<Vec<f32>>,
    sample_rate: u32,
    channels: u16,
    frames: u64,
    opts: AudioClipOptions,
    meta: ClipMeta,
    cursor: TickCursor,
    /// Local time up to which audio was already served.
    served: i64,
}

impl AudioClip {
    /// Interleaved `f32` samples in `[-1, 1]`.
    pub fn from_pcm(
        samples: Vec<f32>,
        sample_rate: u32,
        channels: u16,
        opts: AudioClipOptions,
    ) -> MontageResult<Self> {
        if sample_rate == 0 || channels == 0 {
            return Err(MontageError::config(
                "audio sample rate and channel count must be non-zero",
            ));
        }
        if !samples.len().is_multiple_of(usize::from(channels)) {
            return Err(MontageError::config(format!(
                "audio buffer of {} samples is not a multiple of {channels} channels",
                samples.len()
            )));
        }
        if !opts.volume.is_finite() || opts.volume < 0.0 {
            return Err(MontageError::config("audio volume must be finite and non-negative"));
        }
        let frames = (samples.len() / usize::from(channels)) as u64;
        if frames == 0 && opts.loop_ {
            return Err(MontageError::config("cannot loop an empty audio clip"));
        }
        let duration = if opts.loop_ {
            UNBOUNDED
        } else {
            sample_to_time(frames, sample_rate)
        };
        Ok(Self {
            samples: Arc::new(samples),
            sample_rate,
            channels,
            frames,
            opts,
            meta: ClipMeta {
                duration,
                width: 0,
                height: 0,
                audio: Some(AudioInfo {
                    sample_rate,
                    channels,
                }),
            },
            cursor: TickCursor::default(),
            served: 0,
        })
    }

    /// Decodes a RIFF WAV file (integer or float PCM).
    pub fn from_wav(bytes: &[u8], opts: AudioClipOptions) -> MontageResult<Self> {
        let reader = hound::WavReader::new(Cursor::new(bytes)).context("open wav")?;
        let spec = reader.spec();
        let samples = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<Vec<_>, _>>()
                .context("decode wav float samples")?,
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<Result<Vec<_>, _>>()
                    .context("decode wav integer samples")?
            }
        };
        tracing::debug!(
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            bits = spec.bits_per_sample,
            "wav decoded"
        );
        Self::from_pcm(samples, spec.sample_rate, spec.channels, opts)
    }

    /// Copies frames `[from, to)` of the (possibly looped) source.
    fn slice(&self, from: u64, to: u64) -> Vec<f32> {
        let ch = usize::from(self.channels);
        let mut out = Vec::with_capacity((to - from) as usize * ch);
        for frame in from..to {
            let idx = if self.opts.loop_ {
                frame % self.frames
            } else if frame < self.frames {
                frame
            } else {
                break;
            };
            let start = idx as usize * ch;
            out.extend(
                self.samples[start..start + ch]
                    .iter()
                    .map(|s| s * self.opts.volume),
            );
        }
        out
    }

    fn serve_until(&mut self, end: i64) -> AudioPayloads {
        let mut out = AudioPayloads::new();
        if end <= self.served {
            return out;
        }
        let from = time_to_sample(self.served, self.sample_rate);
        let to = time_to_sample(end, self.sample_rate);
        let samples = self.slice(from, to);
        if !samples.is_empty() {
            out.push(AudioData {
                timestamp: self.served,
                duration: end - self.served,
                sample_rate: self.sample_rate,
                channels: self.channels,
                samples,
            });
        }
        self.served = end;
        out
    }

    fn tick_now(&mut self, time: i64) -> MontageResult<ClipTick> {
        self.cursor.advance(time)?;
        if self.cursor.is_done() {
            return Ok(ClipTick::done(AudioPayloads::new()));
        }
        if time >= self.meta.duration {
            let audio = self.serve_until(self.meta.duration);
            self.cursor.finish();
            return Ok(ClipTick::done(audio));
        }
        Ok(ClipTick::success(None, self.serve_until(time)))
    }
}

impl Clip for AudioClip {
    fn ready(&mut self) -> BoxFuture<'_, MontageResult<ClipMeta>> {
        Box::pin(future::ready(Ok(self.meta)))
    }

    fn tick(&mut self, time: i64) -> BoxFuture<'_, MontageResult<ClipTick>> {
        Box::pin(future::ready(self.tick_now(time)))
    }

    fn destroy(&mut self) {
        self.samples = Arc::new(Vec::new());
        self.frames = 0;
        self.cursor.finish();
    }
}

#[cfg(test)]
#[path = "../../tests/unit/clip/audio_clip.rs"]
mod tests;
