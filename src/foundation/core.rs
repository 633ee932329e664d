use crate::foundation::error::{MontageError, MontageResult};

pub use kurbo::Rect;

/// Marks a clip or entry duration with no natural end.
pub const UNBOUNDED: i64 = i64::MAX;

/// Microseconds per second; every timestamp in the crate is expressed in microseconds.
pub const MICROS_PER_SEC: i64 = 1_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Fps {
    pub num: u32,
    pub den: u32, // must be > 0
}

impl Default for Fps {
    fn default() -> Self {
        Self { num: 30, den: 1 }
    }
}

impl Fps {
    pub fn new(num: u32, den: u32) -> MontageResult<Self> {
        if den == 0 {
            return Err(MontageError::config("fps den must be > 0"));
        }
        if num == 0 {
            return Err(MontageError::config("fps num must be > 0"));
        }
        Ok(Self { num, den })
    }

    pub fn validate(self) -> MontageResult<()> {
        Self::new(self.num, self.den).map(|_| ())
    }

    /// Virtual clock: exact start time of frame `index`, floored to whole microseconds.
    pub fn tick_time(self, index: u64) -> i64 {
        let num = u128::from(index) * (MICROS_PER_SEC as u128) * u128::from(self.den);
        let t = num / u128::from(self.num);
        i64::try_from(t).unwrap_or(i64::MAX)
    }

    /// Upper bound of a single tick duration (ticks differ by at most one microsecond).
    pub fn frame_interval(self) -> i64 {
        let num = (MICROS_PER_SEC as u128) * u128::from(self.den);
        let den = u128::from(self.num);
        i64::try_from(num.div_ceil(den)).unwrap_or(i64::MAX)
    }

    /// Number of ticks needed so that the clock reaches or passes `end`.
    pub fn ticks_until(self, end: i64) -> u64 {
        if end <= 0 {
            return 0;
        }
        let num = (end as u128) * u128::from(self.num);
        let den = (MICROS_PER_SEC as u128) * u128::from(self.den);
        let mut n = u64::try_from(num / den).unwrap_or(u64::MAX);
        while self.tick_time(n) < end {
            n += 1;
        }
        n
    }
}

/// Sample position of a microsecond timestamp (floored). Negative times clamp to 0.
pub fn time_to_sample(time: i64, sample_rate: u32) -> u64 {
    if time <= 0 {
        return 0;
    }
    let v = (time as u128) * u128::from(sample_rate) / (MICROS_PER_SEC as u128);
    u64::try_from(v).unwrap_or(u64::MAX)
}

/// Number of sample frames covering `[start, end)`. Consecutive spans telescope exactly.
pub fn samples_in_span(start: i64, end: i64, sample_rate: u32) -> u64 {
    time_to_sample(end, sample_rate).saturating_sub(time_to_sample(start, sample_rate))
}

/// Microsecond timestamp of a sample position.
pub fn sample_to_time(sample: u64, sample_rate: u32) -> i64 {
    if sample_rate == 0 {
        return 0;
    }
    let v = u128::from(sample) * (MICROS_PER_SEC as u128) / u128::from(sample_rate);
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Premultiplied RGBA8 (r,g,b already multiplied by a).
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Rgba8Premul {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba8Premul {
    pub fn transparent() -> Self {
        Self {
            r: 0,
            g: 0,
            b: 0,
            a: 0,
        }
    }

    pub fn from_straight_rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        fn premul(c: u8, a: u8) -> u8 {
            let c = u16::from(c);
            let a = u16::from(a);
            (((c * a) + 127) / 255) as u8
        }

        Self {
            r: premul(r, a),
            g: premul(g, a),
            b: premul(b, a),
            a,
        }
    }

    pub fn to_array(self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/core.rs"]
mod tests;
