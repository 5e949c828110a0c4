use serde::Serialize;

use crate::classifier::{StreamFamily, StreamKind, TrackId};
use crate::scanner::ContainerStreamId;
use crate::sink::EsSink;
use crate::timestamp::TimestampTracker;
use crate::{DemuxError, Result, TimestampConfig};

/// Per-track totals reported at the end of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackSummary {
    pub id: String,
    pub stream: ContainerStreamId,
    pub kind: StreamKind,
    pub family: StreamFamily,
    pub units: u64,
    pub bytes: u64,
    pub truncated_units: u64,
    pub invalid_headers: u64,
    pub discontinuities: u64,
    pub first_pts: Option<u64>,
    pub last_pts: Option<u64>,
    /// PTS span in 90 kHz ticks
    pub duration: Option<u64>,
}

/// Output destination of one selected stream, created when its first unit
/// is routed and dropped when the job ends
pub struct Track {
    id: TrackId,
    label: String,
    family: StreamFamily,
    sink: Box<dyn EsSink>,
    timestamps: TimestampTracker,
    units: u64,
    bytes: u64,
    /// Bytes of units whose header parsed
    valid_bytes: u64,
    truncated_units: u64,
    invalid_headers: u64,
}

impl Track {
    pub fn new(
        id: TrackId,
        family: StreamFamily,
        sink: Box<dyn EsSink>,
        timestamps: &TimestampConfig,
    ) -> Self {
        Self {
            id,
            label: id.label(),
            family,
            sink,
            timestamps: TimestampTracker::new(timestamps.clone(), family.is_sparse()),
            units: 0,
            bytes: 0,
            valid_bytes: 0,
            truncated_units: 0,
            invalid_headers: 0,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn timestamps_mut(&mut self) -> &mut TimestampTracker {
        &mut self.timestamps
    }

    /// Bytes handed to the sink for units with a well-formed header
    pub fn valid_bytes(&self) -> u64 {
        self.valid_bytes
    }

    fn sink_error(&self, source: std::io::Error) -> DemuxError {
        DemuxError::Sink {
            track: self.label.clone(),
            source,
        }
    }

    /// Writes the output of one unit and updates the counters.
    pub fn write_unit(&mut self, data: &[u8], truncated: bool, header_invalid: bool) -> Result<()> {
        if !data.is_empty() {
            self.sink.append(data).map_err(|e| self.sink_error(e))?;
        }
        self.units += 1;
        self.bytes += data.len() as u64;
        if !header_invalid {
            self.valid_bytes += data.len() as u64;
        }
        self.truncated_units += u64::from(truncated);
        self.invalid_headers += u64::from(header_invalid);
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush().map_err(|e| self.sink_error(e))
    }

    pub fn summary(&self) -> TrackSummary {
        TrackSummary {
            id: self.label.clone(),
            stream: self.id.stream,
            kind: self.id.kind,
            family: self.family,
            units: self.units,
            bytes: self.bytes,
            truncated_units: self.truncated_units,
            invalid_headers: self.invalid_headers,
            discontinuities: self.timestamps.discontinuities(),
            first_pts: self.timestamps.first_pts(),
            last_pts: self.timestamps.last_pts(),
            duration: self.timestamps.duration(),
        }
    }
}
