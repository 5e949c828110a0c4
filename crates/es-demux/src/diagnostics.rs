use std::fmt;

use serde::Serialize;

use crate::error::{DesyncError, MalformedHeaderError};
use crate::reassembler::TruncationCause;
use crate::timestamp::DiscontinuityEvent;

/// Category of a recoverable condition met during extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    Desync,
    MalformedHeader,
    TruncatedUnit,
    Discontinuity,
    ContinuityGap,
    TransportError,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiagnosticKind::Desync => "desync",
            DiagnosticKind::MalformedHeader => "malformed-header",
            DiagnosticKind::TruncatedUnit => "truncated-unit",
            DiagnosticKind::Discontinuity => "discontinuity",
            DiagnosticKind::ContinuityGap => "continuity-gap",
            DiagnosticKind::TransportError => "transport-error",
        };
        f.write_str(name)
    }
}

/// One recorded event. Rendered as a single log line by its `Display`
/// implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Label of the affected track; `None` for container-wide events
    pub track: Option<String>,
    pub offset: u64,
    /// Previous timestamp, for discontinuities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<u64>,
    /// New timestamp, for discontinuities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncation: Option<TruncationCause>,
    pub detail: String,
}

impl Diagnostic {
    fn new(kind: DiagnosticKind, track: Option<String>, offset: u64, detail: String) -> Self {
        Self {
            kind,
            track,
            offset,
            previous: None,
            current: None,
            truncation: None,
            detail,
        }
    }

    pub fn desync(error: &DesyncError) -> Self {
        Self::new(
            DiagnosticKind::Desync,
            None,
            error.offset,
            format!("skipped {} bytes", error.skipped),
        )
    }

    pub fn malformed_header(track: String, offset: u64, error: &MalformedHeaderError) -> Self {
        Self::new(
            DiagnosticKind::MalformedHeader,
            Some(track),
            offset,
            error.to_string(),
        )
    }

    pub fn truncated_unit(track: String, offset: u64, cause: TruncationCause, bytes: usize) -> Self {
        let detail = match cause {
            TruncationCause::EndOfInputOpen => format!("unit open at end of input, {bytes} bytes"),
            TruncationCause::CutAtEndOfInput => {
                format!("unit cut mid-packet at end of input, {bytes} bytes")
            }
            TruncationCause::ShortOfDeclared => {
                format!("unit shorter than declared, {bytes} bytes")
            }
        };
        let mut diagnostic = Self::new(DiagnosticKind::TruncatedUnit, Some(track), offset, detail);
        diagnostic.truncation = Some(cause);
        diagnostic
    }

    pub fn discontinuity(track: String, event: &DiscontinuityEvent) -> Self {
        let mut diagnostic = Self::new(
            DiagnosticKind::Discontinuity,
            Some(track),
            event.offset,
            format!("{} jumped by {} ticks", event.kind, event.delta),
        );
        diagnostic.previous = Some(event.previous);
        diagnostic.current = Some(event.current);
        diagnostic
    }

    pub fn continuity_gap(track: String, offset: u64, expected: u8, found: u8) -> Self {
        Self::new(
            DiagnosticKind::ContinuityGap,
            Some(track),
            offset,
            format!("expected counter {expected}, found {found}"),
        )
    }

    pub fn transport_error(track: String, offset: u64) -> Self {
        Self::new(
            DiagnosticKind::TransportError,
            Some(track),
            offset,
            "transport error indicator set".to_string(),
        )
    }

    /// Whether this event turns a successful job into a partial one
    pub fn degrades_status(&self) -> bool {
        match self.kind {
            DiagnosticKind::Desync | DiagnosticKind::MalformedHeader => true,
            DiagnosticKind::TruncatedUnit => {
                self.truncation != Some(TruncationCause::EndOfInputOpen)
            }
            DiagnosticKind::Discontinuity
            | DiagnosticKind::ContinuityGap
            | DiagnosticKind::TransportError => false,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} track={} offset={}",
            self.kind,
            self.track.as_deref().unwrap_or("-"),
            self.offset
        )?;
        if let (Some(previous), Some(current)) = (self.previous, self.current) {
            write!(f, " previous={previous} current={current}")?;
        }
        write!(f, " {}", self.detail)
    }
}
