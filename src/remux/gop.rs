use std::collections::VecDeque;

use crate::foundation::error::{MontageError, MontageResult};
use crate::mp4::Sample;

/// Interleaves the output of two video encoders that take turns coding whole GOPs.
///
/// Each encoder fills its own ordered buffer. Samples leave in presentation order: the active
/// buffer is continued through its GOP, and the other buffer takes over only at a keyframe that
/// lines up with the end of the last emitted sample.
#[derive(Debug)]
pub struct GopMerger {
    buffers: [VecDeque<Sample>; 2],
    active: usize,
    last_end: i64,
    last_dts: Option<i64>,
    frame_interval: i64,
}

impl GopMerger {
    pub fn new(frame_interval: i64) -> Self {
        Self {
            buffers: [VecDeque::new(), VecDeque::new()],
            active: 0,
            last_end: 0,
            last_dts: None,
            frame_interval: frame_interval.max(1),
        }
    }

    pub fn push(&mut self, encoder: usize, sample: Sample) {
        self.buffers[encoder & 1].push_back(sample);
    }

    pub fn buffered(&self) -> usize {
        self.buffers[0].len() + self.buffers[1].len()
    }

    fn contiguous(&self, s: &Sample) -> bool {
        (s.dts - self.last_end).abs() < self.frame_interval
    }

    fn pick(&self) -> Option<usize> {
        let (a, b) = (self.active, 1 - self.active);
        let head_a = self.buffers[a].front();
        let head_b = self.buffers[b].front();

        if head_a.is_some_and(|h| !h.is_sync || self.contiguous(h)) {
            return Some(a);
        }
        if head_b.is_some_and(|h| h.is_sync && self.contiguous(h)) {
            return Some(b);
        }
        match (head_a, head_b) {
            (Some(x), Some(y)) if x.is_sync && y.is_sync => {
                Some(if x.dts <= y.dts { a } else { b })
            }
            _ => None,
        }
    }

    fn take(&mut self, idx: usize) -> MontageResult<Option<Sample>> {
        let Some(s) = self.buffers[idx].pop_front() else {
            return Ok(None);
        };
        if let Some(last) = self.last_dts
            && s.dts < last
        {
            return Err(MontageError::sequence(format!(
                "gop merge produced dts {} after {last}",
                s.dts
            )));
        }
        self.active = idx;
        self.last_dts = Some(s.dts);
        self.last_end = s.dts + s.duration;
        Ok(Some(s))
    }

    /// Emits every sample whose position is already decided.
    ///
    /// One sample leaves per iteration, so the loop ends after at most `buffered()` iterations.
    pub fn pop_ready(&mut self) -> MontageResult<Vec<Sample>> {
        let mut out = Vec::new();
        while let Some(idx) = self.pick() {
            match self.take(idx)? {
                Some(s) => out.push(s),
                None => break,
            }
        }
        Ok(out)
    }

    /// Empties both buffers once no more input will arrive; leftovers are merged by timestamp.
    pub fn drain_all(&mut self) -> MontageResult<Vec<Sample>> {
        let mut out = self.pop_ready()?;
        loop {
            let idx = match (self.buffers[0].front(), self.buffers[1].front()) {
                (Some(x), Some(y)) => {
                    if x.dts <= y.dts {
                        0
                    } else {
                        1
                    }
                }
                (Some(_), None) => 0,
                (None, Some(_)) => 1,
                (None, None) => break,
            };
            match self.take(idx)? {
                Some(s) => out.push(s),
                None => break,
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
#[path = "../../tests/unit/remux/gop.rs"]
mod tests;
