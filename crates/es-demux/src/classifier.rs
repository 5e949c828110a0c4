//! # Stream Classifier & Router
//!
//! Decides what each container stream carries and where its units go.
//!
//! Stream ids only give part of the answer. Private stream 1 is a carrier
//! for subpictures, AC-3, DTS, LPCM and teletext, so it is disambiguated by
//! the substream id in program streams and by the PMT stream type and
//! descriptors in transport streams. When a transport stream declares
//! nothing useful, the first payload bytes decide.
//!
//! A decision is made once per container stream and cached.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;
use ts::{ElementaryStreamInfo, StreamType, descriptor};

use crate::DemuxError;
use crate::pes::stream_id;
use crate::scanner::ContainerStreamId;

/// Coarse stream category used for filtering and track tagging
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
    Subpicture,
    Other,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamKind::Video => "video",
            StreamKind::Audio => "audio",
            StreamKind::Subpicture => "subpicture",
            StreamKind::Other => "other",
        };
        f.write_str(name)
    }
}

impl FromStr for StreamKind {
    type Err = DemuxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "video" => Ok(StreamKind::Video),
            "audio" => Ok(StreamKind::Audio),
            "subpicture" | "subtitle" => Ok(StreamKind::Subpicture),
            "other" => Ok(StreamKind::Other),
            _ => Err(DemuxError::InvalidConfig(format!("unknown stream kind '{s}'"))),
        }
    }
}

/// Which stream of a kind to select
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamNumber {
    #[default]
    Any,
    /// Low bits of the stream id or substream id (0xE0 + n, 0x80 + n, ...)
    Index(u8),
    /// Transport stream PID
    Pid(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamFilter {
    /// `None` selects every stream
    pub kind: Option<StreamKind>,
    pub number: StreamNumber,
}

impl StreamFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn of_kind(kind: StreamKind) -> Self {
        Self {
            kind: Some(kind),
            number: StreamNumber::Any,
        }
    }

    pub fn with_number(mut self, number: StreamNumber) -> Self {
        self.number = number;
        self
    }
}

impl fmt::Display for StreamFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "{kind}")?,
            None => f.write_str("all")?,
        }
        match self.number {
            StreamNumber::Any => Ok(()),
            StreamNumber::Index(n) => write!(f, " #{n}"),
            StreamNumber::Pid(pid) => write!(f, " pid 0x{pid:04x}"),
        }
    }
}

/// Concrete payload format of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFamily {
    /// MPEG-1/2 video
    Video,
    Avc,
    Hevc,
    MpegAudio,
    Aac,
    Ac3,
    Dts,
    Lpcm,
    Subpicture,
    Teletext,
    Padding,
    Unknown,
}

impl StreamFamily {
    pub fn kind(self) -> StreamKind {
        match self {
            StreamFamily::Video | StreamFamily::Avc | StreamFamily::Hevc => StreamKind::Video,
            StreamFamily::MpegAudio
            | StreamFamily::Aac
            | StreamFamily::Ac3
            | StreamFamily::Dts
            | StreamFamily::Lpcm => StreamKind::Audio,
            StreamFamily::Subpicture => StreamKind::Subpicture,
            StreamFamily::Teletext | StreamFamily::Padding | StreamFamily::Unknown => {
                StreamKind::Other
            }
        }
    }

    /// File extension for the extracted elementary stream
    pub fn extension(self) -> &'static str {
        match self {
            StreamFamily::Video => "m2v",
            StreamFamily::Avc => "264",
            StreamFamily::Hevc => "265",
            StreamFamily::MpegAudio => "mpa",
            StreamFamily::Aac => "aac",
            StreamFamily::Ac3 => "ac3",
            StreamFamily::Dts => "dts",
            StreamFamily::Lpcm => "lpcm",
            StreamFamily::Subpicture => "sup",
            StreamFamily::Teletext | StreamFamily::Padding | StreamFamily::Unknown => "bin",
        }
    }

    /// Subpicture streams carry a unit every few seconds at most
    pub fn is_sparse(self) -> bool {
        self == StreamFamily::Subpicture
    }
}

fn family_of_stream_type(stream_type: StreamType) -> Option<StreamFamily> {
    let family = match stream_type {
        StreamType::Mpeg1Video
        | StreamType::Mpeg2Video
        | StreamType::Mpeg4Visual
        | StreamType::H266 => StreamFamily::Video,
        StreamType::H264 => StreamFamily::Avc,
        StreamType::H265 => StreamFamily::Hevc,
        StreamType::Mpeg1Audio | StreamType::Mpeg2Audio => StreamFamily::MpegAudio,
        StreamType::AdtsAac | StreamType::LatmAac => StreamFamily::Aac,
        StreamType::Ac3 | StreamType::EAc3 | StreamType::TrueHd => StreamFamily::Ac3,
        StreamType::Dts | StreamType::DtsHd => StreamFamily::Dts,
        StreamType::HdmvPgs | StreamType::HdmvText => StreamFamily::Subpicture,
        StreamType::PrivatePes | StreamType::Unknown(_) => return None,
    };
    Some(family)
}

fn family_of_descriptors(info: &ElementaryStreamInfo) -> Option<StreamFamily> {
    info.descriptor_tags.iter().find_map(|&tag| match tag {
        descriptor::SUBTITLING => Some(StreamFamily::Subpicture),
        descriptor::AC3 | descriptor::ENHANCED_AC3 => Some(StreamFamily::Ac3),
        descriptor::DTS => Some(StreamFamily::Dts),
        descriptor::AAC => Some(StreamFamily::Aac),
        descriptor::TELETEXT | descriptor::VBI_TELETEXT => Some(StreamFamily::Teletext),
        _ => None,
    })
}

/// Guess for an undeclared private stream from its first payload bytes
fn family_of_payload(payload: &[u8]) -> StreamFamily {
    match payload {
        // DVB subtitle data identifier and subtitle stream id
        [0x20, 0x00, ..] => StreamFamily::Subpicture,
        [0x0B, 0x77, ..] => StreamFamily::Ac3,
        // EBU teletext data identifiers
        [0x10..=0x1F, ..] => StreamFamily::Teletext,
        _ => StreamFamily::Unknown,
    }
}

fn family_of_substream(substream: u8) -> StreamFamily {
    match substream {
        0x20..=0x3F => StreamFamily::Subpicture,
        0x80..=0x87 => StreamFamily::Ac3,
        0x88..=0x8F => StreamFamily::Dts,
        0xA0..=0xAF => StreamFamily::Lpcm,
        _ => StreamFamily::Unknown,
    }
}

/// Decides the payload family of a container stream.
///
/// `payload` is the unit payload after the PES header.
pub fn identify(
    stream: ContainerStreamId,
    stream_id: u8,
    declared: Option<&ElementaryStreamInfo>,
    payload: &[u8],
) -> StreamFamily {
    if let Some(info) = declared {
        if let Some(family) = family_of_stream_type(info.stream_type) {
            return family;
        }
        if let Some(family) = family_of_descriptors(info) {
            return family;
        }
    }
    match stream_id {
        0xE0..=0xEF | stream_id::EXTENDED => StreamFamily::Video,
        0xC0..=0xDF => StreamFamily::MpegAudio,
        stream_id::PADDING => StreamFamily::Padding,
        stream_id::PRIVATE_STREAM_1 => match stream {
            ContainerStreamId::StreamId {
                substream: Some(sub),
                ..
            } => family_of_substream(sub),
            ContainerStreamId::StreamId { substream: None, .. } => StreamFamily::Unknown,
            ContainerStreamId::Pid(_) => family_of_payload(payload),
        },
        _ => StreamFamily::Unknown,
    }
}

/// Number of a stream within its kind, as matched by [`StreamNumber::Index`]
fn stream_index(stream: ContainerStreamId, stream_id: u8, family: StreamFamily) -> Option<u8> {
    match (stream, family) {
        (
            ContainerStreamId::StreamId {
                substream: Some(sub),
                ..
            },
            _,
        ) => Some(match family {
            StreamFamily::Subpicture => sub & 0x1F,
            _ => sub & 0x07,
        }),
        _ => match stream_id {
            0xE0..=0xEF => Some(stream_id & 0x0F),
            0xC0..=0xDF => Some(stream_id & 0x1F),
            stream_id::PRIVATE_STREAM_1 => Some(0),
            _ => None,
        },
    }
}

/// Track identity: the container stream plus the kind it is tagged with
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TrackId {
    pub stream: ContainerStreamId,
    pub kind: StreamKind,
}

impl TrackId {
    /// File-name friendly label, e.g. `video-pid0100`
    pub fn label(&self) -> String {
        format!("{}-{}", self.kind, self.stream.label())
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.stream)
    }
}

/// Where the units of a container stream go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// A recognized stream selected by the filter
    Track(TrackId),
    /// An unrecognized stream kept under the `Other` tag
    Default(TrackId),
    Discard,
}

impl Route {
    pub fn track(&self) -> Option<TrackId> {
        match self {
            Route::Track(id) | Route::Default(id) => Some(*id),
            Route::Discard => None,
        }
    }
}

/// Routing decision for one container stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub route: Route,
    pub family: StreamFamily,
}

#[derive(Debug)]
pub struct Classifier {
    filter: StreamFilter,
    decisions: HashMap<ContainerStreamId, Decision>,
}

impl Classifier {
    pub fn new(filter: StreamFilter) -> Self {
        Self {
            filter,
            decisions: HashMap::new(),
        }
    }

    pub fn filter(&self) -> StreamFilter {
        self.filter
    }

    /// Cached decision for a stream that has already been routed
    pub fn decision(&self, stream: &ContainerStreamId) -> Option<Decision> {
        self.decisions.get(stream).copied()
    }

    /// Routes a container stream, deciding on first sight.
    pub fn route(
        &mut self,
        stream: ContainerStreamId,
        stream_id: u8,
        declared: Option<&ElementaryStreamInfo>,
        payload: &[u8],
    ) -> Decision {
        if let Some(decision) = self.decisions.get(&stream) {
            return *decision;
        }
        let family = identify(stream, stream_id, declared, payload);
        let decision = Decision {
            route: self.decide(stream, stream_id, family),
            family,
        };
        debug!(%stream, ?family, route = ?decision.route, "stream classified");
        self.decisions.insert(stream, decision);
        decision
    }

    fn decide(&self, stream: ContainerStreamId, stream_id: u8, family: StreamFamily) -> Route {
        let number_matches = match self.filter.number {
            StreamNumber::Any => true,
            StreamNumber::Index(n) => stream_index(stream, stream_id, family) == Some(n),
            StreamNumber::Pid(pid) => stream.pid() == Some(pid),
        };
        if !number_matches || family == StreamFamily::Padding {
            return Route::Discard;
        }
        match self.filter.kind {
            None if family == StreamFamily::Unknown => Route::Default(TrackId {
                stream,
                kind: StreamKind::Other,
            }),
            None => Route::Track(TrackId {
                stream,
                kind: family.kind(),
            }),
            Some(kind) if family.kind() == kind => Route::Track(TrackId { stream, kind }),
            Some(_) => Route::Discard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ps(stream_id: u8, substream: Option<u8>) -> ContainerStreamId {
        ContainerStreamId::StreamId {
            stream_id,
            substream,
        }
    }

    fn declared(stream_type: u8, tags: &[u8]) -> ElementaryStreamInfo {
        ElementaryStreamInfo {
            program_number: 1,
            stream_type: StreamType::from(stream_type),
            descriptor_tags: tags.to_vec(),
        }
    }

    #[test]
    fn test_identify_by_stream_id() {
        assert_eq!(identify(ps(0xE1, None), 0xE1, None, &[]), StreamFamily::Video);
        assert_eq!(identify(ps(0xC3, None), 0xC3, None, &[]), StreamFamily::MpegAudio);
        assert_eq!(identify(ps(0xBE, None), 0xBE, None, &[]), StreamFamily::Padding);
        assert_eq!(identify(ps(0xBF, None), 0xBF, None, &[]), StreamFamily::Unknown);
    }

    #[test]
    fn test_identify_program_stream_substreams() {
        let cases = [
            (0x21, StreamFamily::Subpicture),
            (0x80, StreamFamily::Ac3),
            (0x89, StreamFamily::Dts),
            (0xA0, StreamFamily::Lpcm),
            (0xFF, StreamFamily::Unknown),
        ];
        for (sub, family) in cases {
            assert_eq!(identify(ps(0xBD, Some(sub)), 0xBD, None, &[sub]), family);
        }
    }

    #[test]
    fn test_identify_transport_private_streams() {
        let pid = ContainerStreamId::Pid(0x102);
        let subs = declared(0x06, &[descriptor::SUBTITLING]);
        assert_eq!(identify(pid, 0xBD, Some(&subs), &[]), StreamFamily::Subpicture);
        let ac3 = declared(0x06, &[0x52, descriptor::AC3]);
        assert_eq!(identify(pid, 0xBD, Some(&ac3), &[]), StreamFamily::Ac3);
        let teletext = declared(0x06, &[descriptor::TELETEXT]);
        assert_eq!(identify(pid, 0xBD, Some(&teletext), &[]), StreamFamily::Teletext);
        // the declared stream type wins over the stream id
        let avc = declared(0x1B, &[]);
        assert_eq!(identify(pid, 0xE0, Some(&avc), &[]), StreamFamily::Avc);

        assert_eq!(identify(pid, 0xBD, None, &[0x20, 0x00, 0x0F]), StreamFamily::Subpicture);
        assert_eq!(identify(pid, 0xBD, None, &[0x0B, 0x77]), StreamFamily::Ac3);
        assert_eq!(identify(pid, 0xBD, None, &[0x99]), StreamFamily::Unknown);
    }

    #[test]
    fn test_route_all() {
        let mut classifier = Classifier::new(StreamFilter::all());
        let video = classifier.route(ps(0xE0, None), 0xE0, None, &[]);
        assert_eq!(
            video.route,
            Route::Track(TrackId {
                stream: ps(0xE0, None),
                kind: StreamKind::Video
            })
        );
        let unknown = classifier.route(ps(0xBF, None), 0xBF, None, &[]);
        assert!(matches!(
            unknown.route,
            Route::Default(TrackId {
                kind: StreamKind::Other,
                ..
            })
        ));
        let padding = classifier.route(ps(0xBE, None), 0xBE, None, &[]);
        assert_eq!(padding.route, Route::Discard);
    }

    #[test]
    fn test_route_by_kind_and_number() {
        let filter = StreamFilter::of_kind(StreamKind::Subpicture).with_number(StreamNumber::Index(1));
        let mut classifier = Classifier::new(filter);
        assert_eq!(
            classifier.route(ps(0xBD, Some(0x20)), 0xBD, None, &[]).route,
            Route::Discard
        );
        assert!(matches!(
            classifier.route(ps(0xBD, Some(0x21)), 0xBD, None, &[]).route,
            Route::Track(TrackId {
                kind: StreamKind::Subpicture,
                ..
            })
        ));
        assert_eq!(
            classifier.route(ps(0xE1, None), 0xE1, None, &[]).route,
            Route::Discard
        );

        let mut by_pid = Classifier::new(StreamFilter::all().with_number(StreamNumber::Pid(0x101)));
        assert_eq!(
            by_pid.route(ContainerStreamId::Pid(0x100), 0xE0, None, &[]).route,
            Route::Discard
        );
        assert!(by_pid
            .route(ContainerStreamId::Pid(0x101), 0xC0, None, &[])
            .route
            .track()
            .is_some());
    }

    #[test]
    fn test_decisions_are_cached() {
        let mut classifier = Classifier::new(StreamFilter::all());
        let pid = ContainerStreamId::Pid(0x102);
        let first = classifier.route(pid, 0xBD, None, &[0x20, 0x00]);
        assert_eq!(first.family, StreamFamily::Subpicture);
        // later payloads do not change the decision
        let second = classifier.route(pid, 0xBD, None, &[0x0B, 0x77]);
        assert_eq!(first, second);
        assert_eq!(classifier.decision(&pid), Some(first));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("Audio".parse::<StreamKind>().unwrap(), StreamKind::Audio);
        assert_eq!("subtitle".parse::<StreamKind>().unwrap(), StreamKind::Subpicture);
        assert!("karaoke".parse::<StreamKind>().is_err());
        assert_eq!(
            StreamFilter::of_kind(StreamKind::Audio)
                .with_number(StreamNumber::Index(2))
                .to_string(),
            "audio #2"
        );
    }
}
