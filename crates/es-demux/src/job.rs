//! # Extraction Job
//!
//! Runs the whole pipeline for one input container:
//!
//! ```text
//! reader -> scanner -> reassembler -> header parser -> classifier -> track sink
//!                                                              \-> timestamp tracker
//! ```
//!
//! A job moves through `Idle -> Scanning -> Draining -> Finished`. It always
//! ends with a [`JobReport`]; problems in the input become diagnostics and
//! only failures to read the input or write an output stop the job early.
//!
//! The stream kind to extract is part of [`JobParams`], so a single job type
//! covers video, audio, subpicture and everything at once.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use crate::classifier::{Classifier, StreamFilter, TrackId};
use crate::diagnostics::Diagnostic;
use crate::error::MalformedHeaderError;
use crate::pes::{self, PesHeader};
use crate::reassembler::{PesUnit, Reassembler, TruncationCause};
use crate::scanner::{ContainerFormat, ContainerScanner, ContainerStreamId, PacketAnomaly, ScanEvent};
use crate::sink::{DiagnosticLog, SinkFactory};
use crate::timestamp::TimestampKind;
use crate::track::{Track, TrackSummary};
use crate::{BitstreamReader, DemuxConfig, DemuxError, Result};

/// What a job writes for each unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Elementary stream payload
    #[default]
    ExtractPayload,
    /// One JSON line per unit describing it
    IndexOnly,
}

/// Caller-supplied settings of one job
pub struct JobParams {
    pub filter: StreamFilter,
    pub action: Action,
    pub config: DemuxConfig,
    pub diagnostic_log: Option<Box<dyn DiagnosticLog>>,
    pub cancel: CancellationToken,
}

impl Default for JobParams {
    fn default() -> Self {
        Self::new(StreamFilter::all())
    }
}

impl JobParams {
    pub fn new(filter: StreamFilter) -> Self {
        Self {
            filter,
            action: Action::default(),
            config: DemuxConfig::default(),
            diagnostic_log: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    pub fn with_config(mut self, config: DemuxConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_diagnostic_log(mut self, log: impl DiagnosticLog + 'static) -> Self {
        self.diagnostic_log = Some(Box::new(log));
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    Partial,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Success => f.write_str("success"),
            JobStatus::Partial => f.write_str("partial"),
            JobStatus::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Scanning,
    Draining,
    Finished(JobStatus),
}

/// Outcome of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub status: JobStatus,
    pub message: String,
    /// Detected container, if detection got that far
    pub format: Option<String>,
    pub tracks: Vec<TrackSummary>,
    pub diagnostics: Vec<Diagnostic>,
    pub bytes_written: u64,
    pub units_written: u64,
    /// Fragments dropped because no unit was open for them
    pub orphan_fragments: u64,
    pub orphan_bytes: u64,
    pub cancelled: bool,
}

impl JobReport {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            message: message.into(),
            format: None,
            tracks: Vec::new(),
            diagnostics: Vec::new(),
            bytes_written: 0,
            units_written: 0,
            orphan_fragments: 0,
            orphan_bytes: 0,
            cancelled: false,
        }
    }

    /// Report as pretty-printed JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// One line of index-only output
#[derive(Debug, Clone, Serialize)]
pub struct IndexEntry {
    pub offset: u64,
    pub stream: ContainerStreamId,
    /// Unit size including its header
    pub length: usize,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub random_access: bool,
    pub data_alignment: bool,
    pub gap: bool,
    pub header_valid: bool,
    pub truncation: Option<TruncationCause>,
}

type Opener<R> = Box<dyn FnOnce(&DemuxConfig) -> io::Result<BitstreamReader<R>> + Send>;

/// Extraction of the selected elementary streams of one container
pub struct ExtractionJob<R> {
    opener: Option<Opener<R>>,
    sinks: Box<dyn SinkFactory>,
    params: JobParams,
    state: JobState,
    report: Option<JobReport>,
}

impl ExtractionJob<File> {
    /// Job over a container file. A file that cannot be opened yields a
    /// failed report when the job runs.
    pub fn open(
        path: impl Into<PathBuf>,
        sinks: impl SinkFactory + 'static,
        params: JobParams,
    ) -> Self {
        let path = path.into();
        Self::with_opener(
            Box::new(move |config| BitstreamReader::open(&path, config)),
            Box::new(sinks),
            params,
        )
    }
}

impl<R: Read + Seek + Send + 'static> ExtractionJob<R> {
    /// Job over any seekable input
    pub fn new(input: R, sinks: impl SinkFactory + 'static, params: JobParams) -> Self {
        Self::with_opener(
            Box::new(move |config| BitstreamReader::new(input, config)),
            Box::new(sinks),
            params,
        )
    }

    fn with_opener(opener: Opener<R>, sinks: Box<dyn SinkFactory>, params: JobParams) -> Self {
        Self {
            opener: Some(opener),
            sinks,
            params,
            state: JobState::Idle,
            report: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Token that cancels this job
    pub fn cancel_token(&self) -> CancellationToken {
        self.params.cancel.clone()
    }

    /// Runs the job to completion on a blocking worker thread.
    pub fn spawn(mut self) -> JoinHandle<JobReport> {
        tokio::task::spawn_blocking(move || self.run())
    }

    /// Runs the job to completion. A finished job returns its report again.
    pub fn run(&mut self) -> JobReport {
        if let Some(report) = &self.report {
            return report.clone();
        }
        let span = info_span!(
            "extract",
            filter = %self.params.filter,
            action = ?self.params.action
        );
        let _enter = span.enter();

        let report = match self.opener.take() {
            Some(opener) => self.execute(opener),
            None => JobReport::failed("job input is no longer available"),
        };
        self.state = JobState::Finished(report.status);
        info!(
            status = %report.status,
            bytes = report.bytes_written,
            units = report.units_written,
            tracks = report.tracks.len(),
            "{}",
            report.message
        );
        self.report = Some(report.clone());
        report
    }

    fn execute(&mut self, opener: Opener<R>) -> JobReport {
        let config = self.params.config.clone();
        if let Err(e) = config.validate() {
            return JobReport::failed(e.to_string());
        }
        let reader = match opener(&config) {
            Ok(reader) => reader,
            Err(e) => return JobReport::failed(format!("cannot open input: {e}")),
        };
        let mut scanner = match ContainerScanner::detect(reader, &config) {
            Ok(scanner) => scanner,
            Err(e) => return JobReport::failed(e.to_string()),
        };
        let format = scanner.format();
        self.state = JobState::Scanning;
        debug!(state = ?self.state, %format, "job started");

        let mut run = Extraction {
            format,
            action: self.params.action,
            config: &config,
            classifier: Classifier::new(self.params.filter),
            tracks: BTreeMap::new(),
            sinks: &mut self.sinks,
            log: self.params.diagnostic_log.as_mut(),
            diagnostics: Vec::new(),
            degraded: false,
            held: VecDeque::new(),
            held_bytes: 0,
        };
        let cancel = &self.params.cancel;
        let mut streams: BTreeMap<ContainerStreamId, Reassembler> = BTreeMap::new();
        let mut fatal: Option<DemuxError> = None;
        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let event = match scanner.next() {
                None => break,
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    fatal = Some(e);
                    break;
                }
            };
            let result = match event {
                ScanEvent::Desync(error) => {
                    run.record(Diagnostic::desync(&error));
                    Ok(())
                }
                ScanEvent::Packet(packet) => {
                    run.note_anomalies(&packet.stream, packet.offset, &packet.anomalies);
                    streams
                        .entry(packet.stream)
                        .or_default()
                        .push(packet, &mut |unit| run.accept_unit(unit, &scanner))
                }
            };
            if let Err(e) = result {
                fatal = Some(e);
                break;
            }
        }

        self.state = JobState::Draining;
        debug!(state = ?self.state, cancelled, "scan finished");

        if cancelled {
            let open = streams
                .values_mut()
                .map(Reassembler::discard)
                .filter(|d| *d)
                .count();
            let held = run.held.len();
            run.held.clear();
            info!(open, held, "job cancelled, unwritten units discarded");
        } else {
            for reassembler in streams.values_mut() {
                if let Err(e) = reassembler.drain(&mut |unit| run.accept_unit(unit, &scanner)) {
                    fatal.get_or_insert(e);
                }
            }
            if let Err(e) = run.release_held(&scanner) {
                fatal.get_or_insert(e);
            }
        }
        for track in run.tracks.values_mut() {
            if let Err(e) = track.flush() {
                fatal.get_or_insert(e);
            }
        }

        let orphans = (
            streams.values().map(Reassembler::orphans).sum(),
            streams.values().map(Reassembler::orphan_bytes).sum(),
        );
        run.finish(fatal, cancelled, orphans)
    }
}

/// Mutable state of a running job
struct Extraction<'a> {
    format: ContainerFormat,
    action: Action,
    config: &'a DemuxConfig,
    classifier: Classifier,
    tracks: BTreeMap<TrackId, Track>,
    sinks: &'a mut Box<dyn SinkFactory>,
    log: Option<&'a mut Box<dyn DiagnosticLog>>,
    diagnostics: Vec<Diagnostic>,
    /// A recorded event downgrades the status
    degraded: bool,
    /// Transport stream units that arrived before any PMT
    held: VecDeque<PesUnit>,
    held_bytes: usize,
}

impl Extraction<'_> {
    fn record(&mut self, diagnostic: Diagnostic) {
        self.degraded |= diagnostic.degrades_status();
        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.record(&diagnostic.to_string()) {
                warn!(error = %e, "diagnostic log failed, disabling it");
                self.log = None;
            }
        }
        self.diagnostics.push(diagnostic);
    }

    /// Records packet-level anomalies of streams that feed a track
    fn note_anomalies(
        &mut self,
        stream: &ContainerStreamId,
        offset: u64,
        anomalies: &[PacketAnomaly],
    ) {
        if anomalies.is_empty() {
            return;
        }
        let Some(id) = self
            .classifier
            .decision(stream)
            .and_then(|decision| decision.route.track())
        else {
            return;
        };
        for anomaly in anomalies {
            match *anomaly {
                PacketAnomaly::ContinuityGap { expected, found } => {
                    debug!(track = %id, offset, expected, found, "continuity gap");
                    self.record(Diagnostic::continuity_gap(id.label(), offset, expected, found));
                }
                PacketAnomaly::TransportError => {
                    self.record(Diagnostic::transport_error(id.label(), offset));
                }
                PacketAnomaly::Discontinuity => {
                    debug!(track = %id, offset, "signalled timebase discontinuity");
                    if let Some(track) = self.tracks.get_mut(&id) {
                        track.timestamps_mut().reset_reference();
                    }
                }
                PacketAnomaly::Truncated => {}
            }
        }
    }

    fn parse_header(&self, data: &[u8]) -> std::result::Result<PesHeader, MalformedHeaderError> {
        match self.format {
            ContainerFormat::Transport(_) => pes::parse_mpeg2_header(data),
            ContainerFormat::Program => pes::parse_header(data),
        }
    }

    /// Takes a reassembled unit. Transport stream units are held back until
    /// a PMT has been read, so that their streams are classified with the
    /// declared stream types. Past `max_lookahead` held bytes they are
    /// classified by stream id alone.
    fn accept_unit<R: Read + Seek>(
        &mut self,
        unit: PesUnit,
        scanner: &ContainerScanner<R>,
    ) -> Result<()> {
        if scanner.program_map_ready() {
            self.release_held(scanner)?;
            return self.handle_unit(unit, scanner);
        }
        self.held_bytes += unit.data.len();
        self.held.push_back(unit);
        if self.held_bytes > self.config.max_lookahead {
            debug!(
                units = self.held.len(),
                bytes = self.held_bytes,
                "no program map yet, classifying held units by stream id"
            );
            self.release_held(scanner)?;
        }
        Ok(())
    }

    fn release_held<R: Read + Seek>(&mut self, scanner: &ContainerScanner<R>) -> Result<()> {
        self.held_bytes = 0;
        while let Some(unit) = self.held.pop_front() {
            self.handle_unit(unit, scanner)?;
        }
        Ok(())
    }

    fn handle_unit<R: Read + Seek>(
        &mut self,
        unit: PesUnit,
        scanner: &ContainerScanner<R>,
    ) -> Result<()> {
        let data = &unit.data[..];
        let header = self.parse_header(data);
        let stream_id = data.get(3).copied().unwrap_or(0);
        let payload_offset = header
            .as_ref()
            .map_or(6, PesHeader::payload_offset)
            .min(data.len());
        let mut payload = &data[payload_offset..];

        let declared = unit.stream.pid().and_then(|pid| scanner.declared_stream(pid));
        let decision = self
            .classifier
            .route(unit.stream, stream_id, declared, payload);
        let Some(id) = decision.route.track() else {
            return Ok(());
        };

        let track = match self.tracks.entry(id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let sink = self
                    .sinks
                    .create(&id, decision.family, self.action)
                    .map_err(|source| DemuxError::Sink {
                        track: id.label(),
                        source,
                    })?;
                info!(track = %id, family = ?decision.family, "new track");
                entry.insert(Track::new(id, decision.family, sink, &self.config.timestamps))
            }
        };
        let label = track.label().to_string();
        let mut events = Vec::new();

        // An invalid header still yields everything after the first six bytes
        if let Ok(header) = &header {
            if let ContainerStreamId::StreamId {
                substream: Some(sub),
                ..
            } = unit.stream
            {
                payload = &payload[pes::substream_header_len(sub).min(payload.len())..];
            }
            for (kind, value) in [
                (TimestampKind::Pts, header.pts),
                (TimestampKind::Dts, header.dts),
            ] {
                if let Some(value) = value {
                    let (_, event) = track.timestamps_mut().observe(kind, value, unit.offset);
                    events.extend(event);
                }
            }
        }

        let index_line;
        let output = match self.action {
            Action::ExtractPayload => payload,
            Action::IndexOnly => {
                let header = header.as_ref().ok();
                let entry = IndexEntry {
                    offset: unit.offset,
                    stream: unit.stream,
                    length: data.len(),
                    pts: header.and_then(|h| h.pts),
                    dts: header.and_then(|h| h.dts),
                    random_access: unit.random_access,
                    data_alignment: header.is_some_and(|h| h.data_alignment),
                    gap: unit.gap,
                    header_valid: header.is_some(),
                    truncation: unit.truncated,
                };
                let mut line = serde_json::to_vec(&entry)?;
                line.push(b'\n');
                index_line = line;
                &index_line[..]
            }
        };
        track.write_unit(output, unit.truncated.is_some(), header.is_err())?;

        if let Err(e) = &header {
            warn!(track = %label, offset = unit.offset, error = %e, "malformed PES header");
            self.record(Diagnostic::malformed_header(label.clone(), unit.offset, e));
        }
        if let Some(cause) = unit.truncated {
            match cause {
                TruncationCause::EndOfInputOpen => {
                    debug!(track = %label, offset = unit.offset, "unit open at end of input")
                }
                TruncationCause::ShortOfDeclared | TruncationCause::CutAtEndOfInput => {
                    warn!(
                        track = %label,
                        offset = unit.offset,
                        bytes = data.len(),
                        ?cause,
                        "truncated unit"
                    )
                }
            }
            self.record(Diagnostic::truncated_unit(label.clone(), unit.offset, cause, data.len()));
        }
        for event in events {
            warn!(
                track = %label,
                kind = %event.kind,
                previous = event.previous,
                current = event.current,
                offset = event.offset,
                "timestamp discontinuity"
            );
            self.record(Diagnostic::discontinuity(label.clone(), &event));
        }
        Ok(())
    }

    fn finish(
        self,
        fatal: Option<DemuxError>,
        cancelled: bool,
        (orphan_fragments, orphan_bytes): (u64, u64),
    ) -> JobReport {
        let tracks: Vec<TrackSummary> = self.tracks.values().map(Track::summary).collect();
        let bytes_written: u64 = tracks.iter().map(|t| t.bytes).sum();
        let units_written: u64 = tracks.iter().map(|t| t.units).sum();
        // Bytes salvaged from units with a broken header do not count as output
        let produced = self.tracks.values().map(Track::valid_bytes).sum::<u64>() > 0;

        let (status, message) = match (&fatal, produced) {
            (Some(e), false) => (JobStatus::Failed, e.to_string()),
            (Some(e), true) => (JobStatus::Partial, format!("stopped early: {e}")),
            (None, false) if cancelled => {
                (JobStatus::Failed, "cancelled before any output".to_string())
            }
            (None, false) if bytes_written > 0 => (
                JobStatus::Failed,
                format!("only malformed {} units found", self.classifier.filter()),
            ),
            (None, false) => (
                JobStatus::Failed,
                format!("no {} stream found", self.classifier.filter()),
            ),
            (None, true) => {
                let summary = format!(
                    "extracted {units_written} units ({bytes_written} bytes) into {} tracks",
                    tracks.len()
                );
                if cancelled {
                    (JobStatus::Partial, format!("cancelled after {summary}"))
                } else if self.degraded {
                    let errors = self
                        .diagnostics
                        .iter()
                        .filter(|d| d.degrades_status())
                        .count();
                    (
                        JobStatus::Partial,
                        format!("{summary} with {errors} recovered errors"),
                    )
                } else {
                    (JobStatus::Success, summary)
                }
            }
        };

        JobReport {
            status,
            message,
            format: Some(self.format.to_string()),
            tracks,
            diagnostics: self.diagnostics,
            bytes_written,
            units_written,
            orphan_fragments,
            orphan_bytes,
            cancelled,
        }
    }
}
