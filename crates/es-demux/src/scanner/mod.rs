//! # Container Packet Scanner
//!
//! Walks the container with a [`BitstreamReader`] and yields one
//! [`ContainerPacket`] per transport packet (TS) or PES packet (PS). The
//! scanner detects the container flavour itself, follows PAT/PMT on
//! transport streams and recovers from lost sync.
//!
//! Lost sync is reported as a [`ScanEvent::Desync`] carrying the offset where
//! sync was lost and the number of bytes skipped. One event is emitted per
//! episode, or per `resync_window` bytes when the garbage runs longer.

mod program;
mod transport;

use std::fmt;
use std::io::{Read, Seek};

use bytes::Bytes;
use memchr::memmem;
use serde::{Serialize, Serializer};
use tracing::{debug, info};
use ts::{ElementaryStreamInfo, PacketLayout};

use crate::{BitstreamReader, DemuxConfig, DemuxError, DesyncError, Result};

use program::ProgramScanner;
use transport::TransportScanner;

/// Identity of an elementary stream inside its container
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContainerStreamId {
    /// Transport stream PID
    Pid(u16),
    /// Program stream PES stream id, plus the private stream 1 substream id
    StreamId { stream_id: u8, substream: Option<u8> },
}

impl ContainerStreamId {
    /// Short form usable in file names
    pub fn label(&self) -> String {
        match self {
            ContainerStreamId::Pid(pid) => format!("pid{pid:04x}"),
            ContainerStreamId::StreamId {
                stream_id,
                substream: None,
            } => format!("{stream_id:02x}"),
            ContainerStreamId::StreamId {
                stream_id,
                substream: Some(sub),
            } => format!("{stream_id:02x}-{sub:02x}"),
        }
    }

    pub fn pid(&self) -> Option<u16> {
        match self {
            ContainerStreamId::Pid(pid) => Some(*pid),
            ContainerStreamId::StreamId { .. } => None,
        }
    }
}

impl fmt::Display for ContainerStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerStreamId::Pid(pid) => write!(f, "pid 0x{pid:04x}"),
            ContainerStreamId::StreamId {
                stream_id,
                substream: None,
            } => write!(f, "stream 0x{stream_id:02x}"),
            ContainerStreamId::StreamId {
                stream_id,
                substream: Some(sub),
            } => write!(f, "stream 0x{stream_id:02x}/0x{sub:02x}"),
        }
    }
}

impl Serialize for ContainerStreamId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Irregularity observed on a single container packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketAnomaly {
    /// Continuity counter skipped values; packets were lost
    ContinuityGap { expected: u8, found: u8 },
    /// Transport error indicator set by the demodulator
    TransportError,
    /// The adaptation field signals a timebase discontinuity
    Discontinuity,
    /// The last packet of the input is incomplete
    Truncated,
}

/// One fragment of one elementary stream as found in the container
#[derive(Debug, Clone)]
pub struct ContainerPacket {
    pub stream: ContainerStreamId,
    pub continuity_counter: Option<u8>,
    /// Whether a PES unit starts in this payload
    pub payload_start: bool,
    pub payload: Bytes,
    /// Absolute offset of the packet in the input
    pub offset: u64,
    pub anomalies: Vec<PacketAnomaly>,
    pub random_access: bool,
}

impl ContainerPacket {
    pub fn has_gap(&self) -> bool {
        self.anomalies
            .iter()
            .any(|a| matches!(a, PacketAnomaly::ContinuityGap { .. }))
    }
}

#[derive(Debug, Clone)]
pub enum ScanEvent {
    Packet(ContainerPacket),
    Desync(DesyncError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Transport(PacketLayout),
    Program,
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerFormat::Transport(layout) => write!(f, "TS ({} byte packets)", layout.stride()),
            ContainerFormat::Program => f.write_str("PS"),
        }
    }
}

/// Position the scanner can be restarted from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCheckpoint {
    pub offset: u64,
    pub format: ContainerFormat,
}

enum Engine {
    Transport(TransportScanner),
    Program(ProgramScanner),
}

impl Engine {
    fn new(format: ContainerFormat) -> Self {
        match format {
            ContainerFormat::Transport(layout) => Engine::Transport(TransportScanner::new(layout)),
            ContainerFormat::Program => Engine::Program(ProgramScanner::new()),
        }
    }
}

pub struct ContainerScanner<R> {
    reader: BitstreamReader<R>,
    config: DemuxConfig,
    format: ContainerFormat,
    engine: Engine,
    done: bool,
}

/// Bytes examined during format detection
const PROBE_SIZE: usize = 64 * 1024;

/// `00 00 01` followed by a pack, system or PES stream id
pub(crate) fn find_start_code(data: &[u8]) -> Option<usize> {
    memmem::find_iter(data, &[0x00, 0x00, 0x01])
        .find(|&pos| data.get(pos + 3).is_some_and(|&id| id >= 0xB9))
}

fn starts_with_program_stream(data: &[u8]) -> bool {
    data.len() >= 4 && data[..3] == [0x00, 0x00, 0x01] && (data[3] == 0xBA || data[3] >= 0xBC)
}

impl<R: Read + Seek> ContainerScanner<R> {
    /// Probes the input and sets up the matching scanner.
    ///
    /// Scanning starts at the reader's current position, so leading garbage
    /// before the first packet is reported as a desync.
    pub fn detect(mut reader: BitstreamReader<R>, config: &DemuxConfig) -> Result<Self> {
        let probe = PROBE_SIZE.min(config.max_lookahead);
        let available = reader.fill(probe)?;
        let data = &reader.buffered()[..available];

        let format = if starts_with_program_stream(data) {
            ContainerFormat::Program
        } else if let Some((layout, offset)) = ts::detect_layout(data, config.detect_packets) {
            debug!(?layout, offset, "transport stream layout detected");
            ContainerFormat::Transport(layout)
        } else if let Some(layout) = PacketLayout::ALL
            .into_iter()
            .filter_map(|layout| {
                let confirm = config.detect_packets.saturating_sub(1);
                ts::find_sync(data, layout, confirm)
                    .filter(|&start| available - start >= layout.stride() * config.detect_packets)
                    .map(|start| (start, layout))
            })
            .min_by_key(|&(start, _)| start)
            .map(|(_, layout)| layout)
        {
            ContainerFormat::Transport(layout)
        } else if memmem::find(data, &[0x00, 0x00, 0x01, 0xBA]).is_some() {
            ContainerFormat::Program
        } else {
            return Err(DemuxError::UnknownFormat);
        };

        info!(%format, "container detected");
        Ok(Self::with_format(reader, config, format))
    }

    /// Sets up a scanner for a known container format
    pub fn with_format(
        reader: BitstreamReader<R>,
        config: &DemuxConfig,
        format: ContainerFormat,
    ) -> Self {
        Self {
            reader,
            config: config.clone(),
            format,
            engine: Engine::new(format),
            done: false,
        }
    }

    pub fn format(&self) -> ContainerFormat {
        self.format
    }

    /// Offset of the next byte to be scanned
    pub fn position(&self) -> u64 {
        self.reader.position()
    }

    /// PMT declaration for a transport stream PID
    pub fn declared_stream(&self, pid: u16) -> Option<&ElementaryStreamInfo> {
        match &self.engine {
            Engine::Transport(scanner) => scanner.declared_stream(pid),
            Engine::Program(_) => None,
        }
    }

    /// Whether stream declarations are settled: always for a program
    /// stream, once a PMT has been read for a transport stream
    pub fn program_map_ready(&self) -> bool {
        match &self.engine {
            Engine::Transport(scanner) => scanner.has_program_map(),
            Engine::Program(_) => true,
        }
    }

    /// Records the current position. Only valid between packets.
    pub fn checkpoint(&self) -> ScanCheckpoint {
        ScanCheckpoint {
            offset: self.reader.position(),
            format: self.format,
        }
    }

    /// Rewinds to a checkpoint and forgets per-stream continuity state.
    /// Program tables learned so far are kept.
    pub fn restore(&mut self, checkpoint: ScanCheckpoint) -> Result<()> {
        self.reader.seek_to(checkpoint.offset)?;
        if checkpoint.format != self.format {
            self.format = checkpoint.format;
            self.engine = Engine::new(checkpoint.format);
        }
        match &mut self.engine {
            Engine::Transport(scanner) => scanner.reset_continuity(),
            Engine::Program(scanner) => scanner.reset(),
        }
        self.done = false;
        debug!(offset = checkpoint.offset, "scanner restored");
        Ok(())
    }

    fn next_event(&mut self) -> Result<Option<ScanEvent>> {
        match &mut self.engine {
            Engine::Transport(scanner) => scanner.next_event(&mut self.reader, &self.config),
            Engine::Program(scanner) => scanner.next_event(&mut self.reader, &self.config),
        }
    }
}

impl<R: Read + Seek> Iterator for ContainerScanner<R> {
    type Item = Result<ScanEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_event() {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Outcome of a resync search
pub(crate) enum Resync {
    /// A confirmed packet start is now at the cursor
    Found { skipped: u64 },
    /// The window was used up without finding sync
    WindowExhausted { skipped: u64 },
    /// The input ended while searching
    EndOfInput { skipped: u64 },
}

/// Skips bytes until `find` reports a confirmed packet start, the resync
/// window is used up or the input ends.
///
/// `lookahead` is the number of bytes past a candidate that `find` needs to
/// confirm it. When `continuing` is false the byte at the cursor has already
/// been rejected and the search begins one byte later.
pub(crate) fn resync<R: Read + Seek>(
    reader: &mut BitstreamReader<R>,
    config: &DemuxConfig,
    continuing: bool,
    lookahead: usize,
    find: impl Fn(&[u8]) -> Option<usize>,
) -> Result<Resync> {
    let window = config.resync_window;
    let mut skipped = 0usize;
    let mut from = usize::from(!continuing);
    loop {
        let want = (window - skipped + lookahead).min(reader.max_lookahead());
        let available = reader.fill(want)?;
        let limit = (window - skipped).min(available);
        let start = from.min(available);
        let found = find(&reader.buffered()[start..available])
            .map(|pos| pos + start)
            .filter(|&pos| pos < limit);
        if let Some(pos) = found {
            reader.consume(pos);
            skipped += pos;
            return Ok(Resync::Found {
                skipped: skipped as u64,
            });
        }
        reader.consume(limit);
        skipped += limit;
        from = 0;
        if reader.is_exhausted() {
            return Ok(Resync::EndOfInput {
                skipped: skipped as u64,
            });
        }
        if skipped >= window {
            return Ok(Resync::WindowExhausted {
                skipped: skipped as u64,
            });
        }
    }
}

impl<R> ContainerScanner<R> {
    pub fn into_reader(self) -> BitstreamReader<R> {
        self.reader
    }
}
