use std::collections::VecDeque;

use crate::foundation::core::{sample_to_time, time_to_sample};
use crate::foundation::error::{MontageError, MontageResult};
use crate::media::frame::AudioData;

/// Audio of one timeline entry, converted to the output format and indexed by output sample
/// position.
#[derive(Debug)]
struct EntryQueue {
    offset: i64,
    volume: f32,
    /// Output sample position of the first queued frame.
    start: u64,
    samples: VecDeque<f32>,
}

impl EntryQueue {
    fn end(&self, channels: usize) -> u64 {
        self.start + (self.samples.len() / channels) as u64
    }
}

/// Mixes per-entry audio into fixed-format blocks covering consecutive timeline spans.
#[derive(Debug)]
pub struct AudioMixer {
    sample_rate: u32,
    channels: u16,
    entries: Vec<EntryQueue>,
    /// Everything before this position has been mixed.
    mixed: u64,
}

impl AudioMixer {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            entries: Vec::new(),
            mixed: 0,
        }
    }

    /// Registers an entry starting at timeline `offset`; returns its slot.
    pub fn add_entry(&mut self, offset: i64, volume: f32) -> usize {
        self.entries.push(EntryQueue {
            offset,
            volume,
            start: 0,
            samples: VecDeque::new(),
        });
        self.entries.len() - 1
    }

    pub fn queued_frames(&self, slot: usize) -> usize {
        self.entries
            .get(slot)
            .map_or(0, |e| e.samples.len() / usize::from(self.channels))
    }

    /// Queues a clip payload whose timestamp is local to the entry.
    ///
    /// Audio that overlaps what the entry already queued is trimmed. Audio before the entry's
    /// offset is not part of it. Audio behind the mix position is a sequencing error.
    pub fn push(&mut self, slot: usize, data: &AudioData) -> MontageResult<()> {
        let ch = usize::from(self.channels);
        let rate = self.sample_rate;
        let mixed = self.mixed;
        let Some(entry) = self.entries.get_mut(slot) else {
            return Err(MontageError::sequence(format!("no mixer entry in slot {slot}")));
        };
        let start_t = entry.offset.saturating_add(data.timestamp);
        let end_t = start_t.saturating_add(data.duration);
        let start = time_to_sample(start_t, rate);
        let frames = time_to_sample(end_t, rate).saturating_sub(start) as usize;
        if frames == 0 || data.frames() == 0 {
            return Ok(());
        }
        let converted = resample(data, frames, self.channels);

        let origin = time_to_sample(entry.offset, rate);
        let queued = !entry.samples.is_empty();
        let queue_end = entry.end(ch);
        let floor = if queued { queue_end.max(origin) } else { origin };
        let skip = floor.saturating_sub(start) as usize;
        if skip >= frames {
            return Ok(());
        }
        let first = start + skip as u64;
        if first < mixed {
            return Err(MontageError::sequence(format!(
                "audio at {start_t}us arrived after the mix passed {}us",
                sample_to_time(mixed, rate)
            )));
        }
        if !queued {
            entry.start = first;
        } else if first > queue_end {
            let gap = (first - queue_end) as usize;
            entry.samples.extend(std::iter::repeat_n(0.0, gap * ch));
        }
        entry.samples.extend(converted[skip * ch..].iter().copied());
        Ok(())
    }

    /// Mixes the timeline span `[start, end)`: sum of every queue times its volume, clamped.
    /// Spans without any queued audio come out silent.
    pub fn mix(&mut self, start: i64, end: i64) -> MontageResult<AudioData> {
        let ch = usize::from(self.channels);
        let s0 = time_to_sample(start, self.sample_rate);
        let s1 = time_to_sample(end, self.sample_rate).max(s0);
        let frames = (s1 - s0) as usize;
        let mut out = vec![0.0f32; frames * ch];

        let mut sources = 0usize;
        for entry in &mut self.entries {
            if entry.start < s0 {
                let stale = ((s0 - entry.start) as usize).min(entry.samples.len() / ch);
                entry.samples.drain(..stale * ch);
                entry.start += stale as u64;
            }
            if entry.samples.is_empty() || entry.start >= s1 {
                continue;
            }
            sources += 1;
            let lead = (entry.start - s0) as usize;
            let take = frames.saturating_sub(lead).min(entry.samples.len() / ch);
            for (i, v) in entry.samples.drain(..take * ch).enumerate() {
                out[lead * ch + i] += v * entry.volume;
            }
            entry.start += take as u64;
        }
        for v in &mut out {
            *v = v.clamp(-1.0, 1.0);
        }
        self.mixed = s1;
        tracing::trace!(start, end, frames, sources, "audio mixed");

        let mut block = AudioData::new(start, self.sample_rate, self.channels, out)?;
        block.duration = end - start;
        Ok(block)
    }
}

/// Linear interpolation of `data` to exactly `frames` frames in `channels` channels.
fn resample(data: &AudioData, frames: usize, channels: u16) -> Vec<f32> {
    let src_ch = usize::from(data.channels.max(1));
    let dst_ch = usize::from(channels);
    let src_frames = data.frames();
    let sample = |frame: usize, c: usize| -> f32 {
        let base = frame * src_ch;
        if dst_ch == 1 && src_ch > 1 {
            data.samples[base..base + src_ch].iter().sum::<f32>() / src_ch as f32
        } else {
            data.samples[base + c % src_ch]
        }
    };

    let mut out = Vec::with_capacity(frames * dst_ch);
    if src_frames == frames {
        for f in 0..frames {
            for c in 0..dst_ch {
                out.push(sample(f, c));
            }
        }
        return out;
    }
    let step = src_frames as f64 / frames as f64;
    for f in 0..frames {
        let pos = ((f as f64 + 0.5) * step - 0.5).clamp(0.0, (src_frames - 1) as f64);
        let i0 = pos.floor() as usize;
        let i1 = (i0 + 1).min(src_frames - 1);
        let frac = (pos - i0 as f64) as f32;
        for c in 0..dst_ch {
            let a = sample(i0, c);
            let b = sample(i1, c);
            out.push(a + (b - a) * frac);
        }
    }
    out
}

#[cfg(test)]
#[path = "../../tests/unit/timeline/mix.rs"]
mod tests;
