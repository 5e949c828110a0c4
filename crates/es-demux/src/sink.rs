//! Output collaborators of an extraction job.
//!
//! Every track writes to its own [`EsSink`], created on demand by the job's
//! [`SinkFactory`]. Diagnostic lines go to an optional [`DiagnosticLog`].

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::classifier::{StreamFamily, TrackId};
use crate::job::Action;

/// Append-only byte sink for one track
pub trait EsSink: Send {
    fn append(&mut self, data: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;
}

/// Creates the sink of a track when its first unit is routed
pub trait SinkFactory: Send {
    fn create(
        &mut self,
        track: &TrackId,
        family: StreamFamily,
        action: Action,
    ) -> io::Result<Box<dyn EsSink>>;
}

/// Sink over any writer
pub struct WriterSink<W> {
    writer: W,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> EsSink for WriterSink<W> {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Writes each track to `<dir>/<stem>.<track>.<ext>`
#[derive(Debug)]
pub struct FileSinkFactory {
    dir: PathBuf,
    stem: String,
    created: Vec<PathBuf>,
}

impl FileSinkFactory {
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
            created: Vec::new(),
        }
    }

    /// Uses the input file name without its extension as the stem
    pub fn beside(input: &Path, dir: impl Into<PathBuf>) -> Self {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "stream".to_string());
        Self::new(dir, stem)
    }

    pub fn path_for(&self, track: &TrackId, family: StreamFamily, action: Action) -> PathBuf {
        let extension = match action {
            Action::ExtractPayload => family.extension(),
            Action::IndexOnly => "idx.jsonl",
        };
        self.dir
            .join(format!("{}.{}.{}", self.stem, track.label(), extension))
    }

    /// Files created so far
    pub fn created(&self) -> &[PathBuf] {
        &self.created
    }
}

impl SinkFactory for FileSinkFactory {
    fn create(
        &mut self,
        track: &TrackId,
        family: StreamFamily,
        action: Action,
    ) -> io::Result<Box<dyn EsSink>> {
        let path = self.path_for(track, family, action);
        let file = File::create(&path)?;
        debug!(path = %path.display(), %track, "created output file");
        self.created.push(path);
        Ok(Box::new(WriterSink::new(BufWriter::new(file))))
    }
}

type SharedOutputs = Arc<Mutex<BTreeMap<TrackId, Vec<u8>>>>;

/// Keeps every track in memory. Clones share the same buffers, so a caller
/// can hand one clone to a job and read the results from another.
#[derive(Debug, Clone, Default)]
pub struct MemorySinkFactory {
    outputs: SharedOutputs,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outputs(&self) -> BTreeMap<TrackId, Vec<u8>> {
        self.outputs.lock().clone()
    }

    pub fn output(&self, track: &TrackId) -> Option<Vec<u8>> {
        self.outputs.lock().get(track).cloned()
    }
}

struct MemorySink {
    track: TrackId,
    outputs: SharedOutputs,
}

impl EsSink for MemorySink {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.outputs
            .lock()
            .entry(self.track)
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SinkFactory for MemorySinkFactory {
    fn create(
        &mut self,
        track: &TrackId,
        _family: StreamFamily,
        _action: Action,
    ) -> io::Result<Box<dyn EsSink>> {
        self.outputs.lock().entry(*track).or_default();
        Ok(Box::new(MemorySink {
            track: *track,
            outputs: Arc::clone(&self.outputs),
        }))
    }
}

/// Receives one line per diagnostic event
pub trait DiagnosticLog: Send {
    fn record(&mut self, line: &str) -> io::Result<()>;
}

/// Diagnostic log over any writer, one line per event
pub struct WriteDiagnosticLog<W> {
    writer: W,
}

impl<W: Write + Send> WriteDiagnosticLog<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send> DiagnosticLog for WriteDiagnosticLog<W> {
    fn record(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.writer, "{line}")?;
        self.writer.flush()
    }
}

/// In-memory diagnostic log whose clones share the same lines
#[derive(Debug, Clone, Default)]
pub struct SharedDiagnosticLog {
    lines: Arc<Mutex<Vec<String>>>,
}

impl SharedDiagnosticLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl DiagnosticLog for SharedDiagnosticLog {
    fn record(&mut self, line: &str) -> io::Result<()> {
        self.lines.lock().push(line.to_string());
        Ok(())
    }
}
