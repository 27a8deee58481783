//! Handshake padding, fragmentation and timing

use std::io;
use std::ops::RangeInclusive;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Result, VlessError};

/// Handshake records must stay under the record limit with their fixed fields.
pub const MAX_PADDING: usize = 15_000;

/// Shape of handshake flights on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaddingConfig {
    /// Random padding bytes appended inside handshake records
    pub padding: RangeInclusive<usize>,
    /// Size of each physical write
    pub fragment: RangeInclusive<usize>,
    /// Delay before every write after the first
    pub gap: RangeInclusive<Duration>,
    /// Upper bound on writes per flight; 0 or 1 disables fragmentation
    pub max_fragments: usize,
}

/// One physical write of a flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub len: usize,
    pub delay: Duration,
}

impl Default for PaddingConfig {
    fn default() -> Self {
        Self {
            padding: 100..=1000,
            fragment: 64..=1024,
            gap: Duration::ZERO..=Duration::from_millis(10),
            max_fragments: 4,
        }
    }
}

impl PaddingConfig {
    /// No padding, one write per flight.
    pub fn disabled() -> Self {
        Self {
            padding: 0..=0,
            fragment: 1..=1,
            gap: Duration::ZERO..=Duration::ZERO,
            max_fragments: 1,
        }
    }

    pub fn with_padding(mut self, min: usize, max: usize) -> Self {
        self.padding = min..=max;
        self
    }

    pub fn with_fragments(mut self, min: usize, max: usize) -> Self {
        self.fragment = min..=max;
        self
    }

    pub fn with_gap(mut self, min: Duration, max: Duration) -> Self {
        self.gap = min..=max;
        self
    }

    pub fn with_max_fragments(mut self, max_fragments: usize) -> Self {
        self.max_fragments = max_fragments;
        self
    }

    pub fn fragmentation_enabled(&self) -> bool {
        self.max_fragments > 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.padding.start() > self.padding.end() {
            return Err(VlessError::InvalidConfig("padding min exceeds max".into()));
        }
        if *self.padding.end() > MAX_PADDING {
            return Err(VlessError::InvalidConfig(format!(
                "padding may not exceed {} bytes",
                MAX_PADDING
            )));
        }
        if self.fragmentation_enabled() {
            if self.fragment.start() > self.fragment.end() {
                return Err(VlessError::InvalidConfig("fragment min exceeds max".into()));
            }
            if *self.fragment.start() == 0 {
                return Err(VlessError::InvalidConfig("fragment length must be positive".into()));
            }
            if self.gap.start() > self.gap.end() {
                return Err(VlessError::InvalidConfig("gap min exceeds max".into()));
            }
        }
        Ok(())
    }

    /// Draw a padding length.
    pub fn padding_len<R: Rng>(&self, rng: &mut R) -> usize {
        rng.gen_range(self.padding.clone())
    }

    /// Split a flight of `total` bytes into writes.
    ///
    /// With fragmentation enabled and `total >= 2` there are always at least
    /// two writes, never more than `max_fragments`, and the lengths sum to
    /// `total`. The first write has no delay.
    pub fn plan<R: Rng>(&self, total: usize, rng: &mut R) -> Vec<Fragment> {
        if !self.fragmentation_enabled() || total < 2 {
            return vec![Fragment {
                len: total,
                delay: Duration::ZERO,
            }];
        }

        let limit = rng.gen_range(2..=self.max_fragments);
        let mut fragments = Vec::with_capacity(limit);
        let mut remaining = total;
        while remaining > 0 {
            let delay = if fragments.is_empty() {
                Duration::ZERO
            } else {
                rng.gen_range(self.gap.clone())
            };
            if fragments.len() + 1 == limit {
                fragments.push(Fragment {
                    len: remaining,
                    delay,
                });
                break;
            }
            let mut len = rng.gen_range(self.fragment.clone()).min(remaining);
            if fragments.is_empty() && len == total {
                len = rng.gen_range(1..total);
            }
            fragments.push(Fragment { len, delay });
            remaining -= len;
        }
        fragments
    }
}

/// Write `flight` according to `plan`, sleeping between fragments.
pub async fn write_fragmented<W>(writer: &mut W, flight: &[u8], plan: &[Fragment]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut offset = 0;
    for fragment in plan {
        if !fragment.delay.is_zero() {
            tokio::time::sleep(fragment.delay).await;
        }
        let end = (offset + fragment.len).min(flight.len());
        writer.write_all(&flight[offset..end]).await?;
        writer.flush().await?;
        offset = end;
    }
    if offset < flight.len() {
        writer.write_all(&flight[offset..]).await?;
        writer.flush().await?;
    }
    Ok(())
}
