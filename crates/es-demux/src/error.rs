use std::io;

use thiserror::Error;

use crate::timestamp::TimestampKind;

/// Errors that stop or prevent an extraction job
#[derive(Error, Debug)]
pub enum DemuxError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Output sink for {track} failed: {source}")]
    Sink {
        track: String,
        #[source]
        source: io::Error,
    },

    #[error("Lookahead of {requested} bytes exceeds the limit of {limit}")]
    Lookahead { requested: usize, limit: usize },

    #[error("Input is neither a transport stream nor a program stream")]
    UnknownFormat,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Index record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The scanner could not find a packet boundary and skipped bytes to
/// recover
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Lost sync at offset {offset}, skipped {skipped} bytes")]
pub struct DesyncError {
    pub offset: u64,
    pub skipped: u64,
}

/// A PES header failed validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedHeaderError {
    #[error("PES header needs {expected} bytes, unit has {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("Invalid start code prefix 0x{0:06x}")]
    StartCode(u32),

    #[error("Stream id 0x{0:02x} is not a PES stream id")]
    StreamId(u8),

    #[error("Optional header does not start with '10' marker bits (0x{0:02x})")]
    MarkerBits(u8),

    #[error("PTS_DTS_flags value '01' is forbidden")]
    ForbiddenPtsDtsFlags,

    #[error("{kind} prefix 0b{actual:04b} does not match 0b{expected:04b}")]
    TimestampPrefix {
        kind: TimestampKind,
        expected: u8,
        actual: u8,
    },

    #[error("{kind} marker bit {bit} not set")]
    TimestampMarker { kind: TimestampKind, bit: u8 },

    #[error("Header data length {declared} is shorter than the {required} bytes its flags need")]
    HeaderDataLength { declared: usize, required: usize },

    #[error("MPEG-1 header has more than 16 stuffing bytes")]
    Mpeg1Stuffing,

    #[error("Unexpected MPEG-1 header byte 0x{0:02x}")]
    Mpeg1Marker(u8),
}
