//! # es-demux
//!
//! Extracts elementary streams (video, audio, subpictures) from MPEG-2
//! transport streams and program streams.
//!
//! The input is scanned packet by packet with bounded memory, PES units are
//! reassembled per container stream, and every selected stream is written
//! to its own sink. Damaged input is recovered from where possible and
//! reported through [`diagnostics`], never by aborting the job.
//!
//! ## Example
//!
//! ```no_run
//! use es_demux::{ExtractionJob, FileSinkFactory, JobParams, StreamFilter, StreamKind};
//!
//! let sinks = FileSinkFactory::new("out", "movie");
//! let params = JobParams::new(StreamFilter::of_kind(StreamKind::Audio));
//! let report = ExtractionJob::open("movie.ts", sinks, params).run();
//! println!("{}: {}", report.status, report.message);
//! ```

pub mod classifier;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod job;
pub mod pes;
pub mod reader;
pub mod reassembler;
pub mod scanner;
pub mod sink;
pub mod timestamp;
pub mod track;

#[cfg(test)]
mod test_utils;

// Re-export key components for easier access
pub use classifier::{Classifier, StreamFamily, StreamFilter, StreamKind, StreamNumber, TrackId};
pub use config::{DemuxConfig, TimestampConfig};
pub use diagnostics::{Diagnostic, DiagnosticKind};
pub use error::{DemuxError, DesyncError, MalformedHeaderError};
pub use job::{Action, ExtractionJob, IndexEntry, JobParams, JobReport, JobState, JobStatus};
pub use pes::PesHeader;
pub use reader::BitstreamReader;
pub use reassembler::{PesUnit, Reassembler, TruncationCause};
pub use scanner::{ContainerFormat, ContainerScanner, ContainerStreamId, ScanEvent};
pub use sink::{
    DiagnosticLog, EsSink, FileSinkFactory, MemorySinkFactory, SharedDiagnosticLog, SinkFactory,
    WriteDiagnosticLog, WriterSink,
};
pub use track::TrackSummary;

/// Result type for extraction operations
pub type Result<T> = std::result::Result<T, DemuxError>;
