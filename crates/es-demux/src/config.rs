use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::DemuxError;

/// Ticks per second of the PES timestamp clock
pub const PES_CLOCK_HZ: u64 = 90_000;

/// Largest PES packet: 6 header bytes plus a 16-bit length
pub const MAX_PES_PACKET_SIZE: usize = 6 + u16::MAX as usize;

/// Thresholds for timestamp discontinuity detection, in 90 kHz ticks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimestampConfig {
    /// Largest forward step between two samples of the same kind
    pub max_forward_gap: u64,

    /// Largest backward step accepted without flagging, covering PTS
    /// reordering around B-frames
    pub backward_tolerance: u64,

    /// Forward gap limit for sparse tracks such as subpictures
    /// (`None` = unlimited)
    pub sparse_forward_gap: Option<u64>,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            max_forward_gap: 10 * PES_CLOCK_HZ,
            backward_tolerance: PES_CLOCK_HZ,
            sparse_forward_gap: None,
        }
    }
}

/// Tunables for one extraction job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemuxConfig {
    /// Bytes of garbage the scanner skips before reporting a desync
    pub resync_window: usize,

    /// Upper bound for the reader's lookahead buffer
    pub max_lookahead: usize,

    /// Size of each read from the input
    pub read_chunk_size: usize,

    /// Consecutive packets that must line up during format detection
    pub detect_packets: usize,

    /// Extra packets that must follow a sync candidate during resync
    pub resync_confirmations: usize,

    /// Timestamp tracker thresholds
    pub timestamps: TimestampConfig,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            resync_window: 64 * 1024,
            max_lookahead: 256 * 1024,
            read_chunk_size: 64 * 1024,
            detect_packets: 5,
            resync_confirmations: 2,
            timestamps: TimestampConfig::default(),
        }
    }
}

impl Display for DemuxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sparse_display = match self.timestamps.sparse_forward_gap {
            Some(gap) => format!("{gap} ticks"),
            None => "unlimited".to_string(),
        };

        write!(
            f,
            "DemuxConfig {{ resync_window: {} bytes, max_lookahead: {} bytes, max_forward_gap: {} ticks, backward_tolerance: {} ticks, sparse_forward_gap: {} }}",
            self.resync_window,
            self.max_lookahead,
            self.timestamps.max_forward_gap,
            self.timestamps.backward_tolerance,
            sparse_display
        )
    }
}

impl DemuxConfig {
    pub fn with_resync_window(mut self, bytes: usize) -> Self {
        self.resync_window = bytes;
        self
    }

    pub fn with_max_lookahead(mut self, bytes: usize) -> Self {
        self.max_lookahead = bytes;
        self
    }

    pub fn with_timestamps(mut self, timestamps: TimestampConfig) -> Self {
        self.timestamps = timestamps;
        self
    }

    /// Checks the settings against each other.
    ///
    /// The lookahead must hold a whole PES packet because program stream
    /// packets are taken from the buffer in one piece. It must also hold the
    /// resync window plus the confirming packets of a candidate at its far
    /// end, or such a candidate could not be checked.
    pub fn validate(&self) -> Result<(), DemuxError> {
        if self.resync_window == 0 {
            return Err(DemuxError::InvalidConfig(
                "resync_window must be greater than zero".to_string(),
            ));
        }
        if self.max_lookahead < MAX_PES_PACKET_SIZE + 4 {
            return Err(DemuxError::InvalidConfig(format!(
                "max_lookahead must be at least {} bytes, got {}",
                MAX_PES_PACKET_SIZE + 4,
                self.max_lookahead
            )));
        }
        let resync_span = self.resync_span();
        if self.max_lookahead < resync_span {
            return Err(DemuxError::InvalidConfig(format!(
                "max_lookahead must cover resync_window plus {} confirming packets ({resync_span} bytes), got {}",
                self.resync_confirmations + 1,
                self.max_lookahead
            )));
        }
        if self.read_chunk_size == 0 || self.detect_packets == 0 {
            return Err(DemuxError::InvalidConfig(
                "read_chunk_size and detect_packets must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Bytes a resync may need buffered: the window plus the largest
    /// packets that confirm a candidate found at its end
    fn resync_span(&self) -> usize {
        let confirming = ts::PacketLayout::Fec.stride() * (self.resync_confirmations + 1);
        self.resync_window.saturating_add(confirming)
    }
}
