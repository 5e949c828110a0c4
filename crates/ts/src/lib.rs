//! MPEG-2 Transport Stream packet and PSI parsing
//!
//! This crate provides zero-copy TS packet header parsing over [`bytes::Bytes`],
//! record layout detection (188, 192 and 204 byte packets), and a PSI tracker
//! that follows PAT/PMT versions to learn the declared type of each
//! elementary PID.

pub mod error;
pub mod packet;
pub mod pmt;
pub mod psi;

pub use error::TsError;
pub use packet::{
    PID_NULL, PID_PAT, PacketLayout, SYNC_BYTE, TS_PACKET_SIZE, TsPacket, detect_layout,
    find_sync, sync_run,
};
pub use pmt::{StreamType, descriptor, descriptor_tags};
pub use psi::{ElementaryStreamInfo, PatRef, PmtRef, PmtStreamIterator, PmtStreamRef, PsiTracker};

/// Result type for TS parsing operations
pub type Result<T> = std::result::Result<T, TsError>;
