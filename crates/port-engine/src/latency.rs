//! Port latency ranges.

use serde::{Deserialize, Serialize};

/// Latency in samples between a port and the outside world.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyRange {
    pub min: u32,
    pub max: u32,
}

impl LatencyRange {
    pub const ZERO: LatencyRange = LatencyRange { min: 0, max: 0 };

    pub const fn fixed(samples: u32) -> Self {
        Self {
            min: samples,
            max: samples,
        }
    }

    /// Range reported for a physical terminal port: one period of buffering
    /// plus the configured systemic latency.
    pub const fn physical(period: u32, systemic: u32) -> Self {
        Self::fixed(period.saturating_add(systemic))
    }
}

/// Direction a latency range applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LatencyDirection {
    Capture,
    Playback,
}

impl LatencyDirection {
    pub const fn for_playback(playback: bool) -> Self {
        if playback {
            Self::Playback
        } else {
            Self::Capture
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_range_adds_period() {
        let range = LatencyRange::physical(256, 64);
        assert_eq!(range, LatencyRange { min: 320, max: 320 });
    }

    #[test]
    fn physical_range_saturates() {
        assert_eq!(LatencyRange::physical(u32::MAX, 1).max, u32::MAX);
    }
}
