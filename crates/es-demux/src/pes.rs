//! # PES Header Parser
//!
//! Decodes and validates the header at the front of a reassembled PES unit.
//! Parsing is a pure function of the unit bytes.
//!
//! Three header shapes exist:
//!
//! - stream ids that carry no optional header (padding, private stream 2,
//!   program stream map and a few more), whose payload starts right after
//!   the 6-byte packet header
//! - the MPEG-2 optional header, introduced by the `'10'` marker bits
//! - the MPEG-1 header found in MPEG-1 program streams: stuffing, an
//!   optional STD buffer field and the timestamps
//!
//! Timestamps are 33-bit values spread over five bytes with three marker
//! bits, all of which are checked.

use crate::error::MalformedHeaderError;
use crate::timestamp::TimestampKind;

/// `00 00 01` start code prefix shared by all PES packets
pub const START_CODE_PREFIX: u32 = 0x00_0001;

pub mod stream_id {
    pub const PROGRAM_STREAM_MAP: u8 = 0xBC;
    pub const PRIVATE_STREAM_1: u8 = 0xBD;
    pub const PADDING: u8 = 0xBE;
    pub const PRIVATE_STREAM_2: u8 = 0xBF;
    pub const ECM: u8 = 0xF0;
    pub const EMM: u8 = 0xF1;
    pub const DSMCC: u8 = 0xF2;
    pub const H222_TYPE_E: u8 = 0xF8;
    pub const EXTENDED: u8 = 0xFD;
    pub const PROGRAM_STREAM_DIRECTORY: u8 = 0xFF;
}

/// Stream ids whose payload follows the 6-byte packet header directly
pub fn is_headerless(stream_id: u8) -> bool {
    use stream_id::*;
    matches!(
        stream_id,
        PROGRAM_STREAM_MAP
            | PADDING
            | PRIVATE_STREAM_2
            | ECM
            | EMM
            | DSMCC
            | H222_TYPE_E
            | PROGRAM_STREAM_DIRECTORY
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PesSyntax {
    Mpeg2,
    Mpeg1,
    /// No optional header
    None,
}

/// Decoded PES header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PesHeader {
    pub stream_id: u8,
    /// `PES_packet_length`; zero means unbounded
    pub packet_length: u16,
    pub syntax: PesSyntax,
    pub scrambling_control: u8,
    pub priority: bool,
    pub data_alignment: bool,
    /// 90 kHz ticks
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    /// Total header size; the payload starts at this offset
    pub header_length: usize,
}

impl PesHeader {
    #[inline]
    pub fn payload_offset(&self) -> usize {
        self.header_length
    }
}

fn too_short(expected: usize, data: &[u8]) -> MalformedHeaderError {
    MalformedHeaderError::TooShort {
        expected,
        actual: data.len(),
    }
}

/// Decodes a 5-byte timestamp field, checking its prefix and marker bits.
///
/// `accepts` tests the 4-bit prefix; `expected` is what the error reports.
fn decode_timestamp(
    field: &[u8],
    kind: TimestampKind,
    expected: u8,
    accepts: impl Fn(u8) -> bool,
) -> Result<u64, MalformedHeaderError> {
    let prefix = field[0] >> 4;
    if !accepts(prefix) {
        return Err(MalformedHeaderError::TimestampPrefix {
            kind,
            expected,
            actual: prefix,
        });
    }
    for (index, bit) in [(0usize, 7u8), (2, 23), (4, 39)] {
        if field[index] & 0x01 == 0 {
            return Err(MalformedHeaderError::TimestampMarker { kind, bit });
        }
    }
    Ok((((field[0] >> 1) & 0x07) as u64) << 30
        | (field[1] as u64) << 22
        | ((field[2] >> 1) as u64) << 15
        | (field[3] as u64) << 7
        | (field[4] >> 1) as u64)
}

/// Reads the PTS, or the PTS and DTS pair, starting at `data[0]`.
fn decode_timestamps(
    data: &[u8],
    with_dts: bool,
) -> Result<(Option<u64>, Option<u64>), MalformedHeaderError> {
    // Some muxers write the '0011' prefix on a lone PTS; accept both
    let pts = decode_timestamp(
        &data[..5],
        TimestampKind::Pts,
        if with_dts { 0b0011 } else { 0b0010 },
        |prefix| prefix & 0b1110 == 0b0010,
    )?;
    if !with_dts {
        return Ok((Some(pts), None));
    }
    let dts = decode_timestamp(&data[5..10], TimestampKind::Dts, 0b0001, |prefix| {
        prefix == 0b0001
    })?;
    Ok((Some(pts), Some(dts)))
}

fn packet_prologue(data: &[u8]) -> Result<(u8, u16), MalformedHeaderError> {
    if data.len() < 6 {
        return Err(too_short(6, data));
    }
    let prefix = u32::from_be_bytes([0, data[0], data[1], data[2]]);
    if prefix != START_CODE_PREFIX {
        return Err(MalformedHeaderError::StartCode(prefix));
    }
    let stream_id = data[3];
    if stream_id < stream_id::PROGRAM_STREAM_MAP {
        return Err(MalformedHeaderError::StreamId(stream_id));
    }
    Ok((stream_id, u16::from_be_bytes([data[4], data[5]])))
}

fn headerless(stream_id: u8, packet_length: u16) -> PesHeader {
    PesHeader {
        stream_id,
        packet_length,
        syntax: PesSyntax::None,
        scrambling_control: 0,
        priority: false,
        data_alignment: false,
        pts: None,
        dts: None,
        header_length: 6,
    }
}

/// Parses a PES header in either MPEG-1 or MPEG-2 syntax.
///
/// The syntax is chosen from the first byte after the packet length:
/// `'10'` in its top bits selects MPEG-2, anything else is read as MPEG-1.
pub fn parse_header(data: &[u8]) -> Result<PesHeader, MalformedHeaderError> {
    let (stream_id, packet_length) = packet_prologue(data)?;
    if is_headerless(stream_id) {
        return Ok(headerless(stream_id, packet_length));
    }
    let first = *data.get(6).ok_or_else(|| too_short(7, data))?;
    if first & 0xC0 == 0x80 {
        parse_mpeg2(data, stream_id, packet_length)
    } else {
        parse_mpeg1(data, stream_id, packet_length)
    }
}

/// Parses a PES header that must use MPEG-2 syntax, as in transport streams.
pub fn parse_mpeg2_header(data: &[u8]) -> Result<PesHeader, MalformedHeaderError> {
    let (stream_id, packet_length) = packet_prologue(data)?;
    if is_headerless(stream_id) {
        return Ok(headerless(stream_id, packet_length));
    }
    parse_mpeg2(data, stream_id, packet_length)
}

fn parse_mpeg2(
    data: &[u8],
    stream_id: u8,
    packet_length: u16,
) -> Result<PesHeader, MalformedHeaderError> {
    let flags1 = *data.get(6).ok_or_else(|| too_short(9, data))?;
    if flags1 & 0xC0 != 0x80 {
        return Err(MalformedHeaderError::MarkerBits(flags1));
    }
    if data.len() < 9 {
        return Err(too_short(9, data));
    }
    let flags2 = data[7];
    let header_data_length = data[8] as usize;
    let header_length = 9 + header_data_length;
    if data.len() < header_length {
        return Err(too_short(header_length, data));
    }
    let optional = &data[9..header_length];

    let pts_dts_flags = flags2 >> 6;
    let mut required = match pts_dts_flags {
        0b00 => 0,
        0b01 => return Err(MalformedHeaderError::ForbiddenPtsDtsFlags),
        0b10 => 5,
        _ => 10,
    };
    if flags2 & 0x20 != 0 {
        required += 6; // ESCR
    }
    if flags2 & 0x10 != 0 {
        required += 3; // ES rate
    }
    if flags2 & 0x08 != 0 {
        required += 1; // DSM trick mode
    }
    if flags2 & 0x04 != 0 {
        required += 1; // additional copy info
    }
    if flags2 & 0x02 != 0 {
        required += 2; // previous PES CRC
    }
    if flags2 & 0x01 != 0 {
        required += extension_length(optional, required);
    }
    if required > header_data_length {
        return Err(MalformedHeaderError::HeaderDataLength {
            declared: header_data_length,
            required,
        });
    }

    let (pts, dts) = match pts_dts_flags {
        0b10 => decode_timestamps(optional, false)?,
        0b11 => decode_timestamps(optional, true)?,
        _ => (None, None),
    };

    Ok(PesHeader {
        stream_id,
        packet_length,
        syntax: PesSyntax::Mpeg2,
        scrambling_control: (flags1 >> 4) & 0x03,
        priority: flags1 & 0x08 != 0,
        data_alignment: flags1 & 0x04 != 0,
        pts,
        dts,
        header_length,
    })
}

/// Size of the PES extension starting at `optional[at]`. Length fields that
/// lie outside `optional` are not counted; the data length check catches
/// those headers anyway.
fn extension_length(optional: &[u8], at: usize) -> usize {
    let Some(&flags) = optional.get(at) else {
        return 1;
    };
    let mut length = 1;
    if flags & 0x80 != 0 {
        length += 16; // PES private data
    }
    if flags & 0x40 != 0 {
        let pack_field_length = optional.get(at + length).copied().unwrap_or(0) as usize;
        length += 1 + pack_field_length;
    }
    if flags & 0x20 != 0 {
        length += 2; // program packet sequence counter
    }
    if flags & 0x10 != 0 {
        length += 2; // P-STD buffer
    }
    if flags & 0x01 != 0 {
        let extension_field_length =
            optional.get(at + length).map_or(0, |b| (b & 0x7F) as usize);
        length += 1 + extension_field_length;
    }
    length
}

fn parse_mpeg1(
    data: &[u8],
    stream_id: u8,
    packet_length: u16,
) -> Result<PesHeader, MalformedHeaderError> {
    let mut pos = 6;
    let mut stuffing = 0;
    while data.get(pos) == Some(&0xFF) {
        stuffing += 1;
        if stuffing > 16 {
            return Err(MalformedHeaderError::Mpeg1Stuffing);
        }
        pos += 1;
    }
    let mut byte = *data.get(pos).ok_or_else(|| too_short(pos + 1, data))?;
    if byte & 0xC0 == 0x40 {
        // STD buffer scale and size
        pos += 2;
        byte = *data.get(pos).ok_or_else(|| too_short(pos + 1, data))?;
    }

    let (pts, dts) = match byte & 0xF0 {
        0x20 | 0x30 => {
            let with_dts = byte & 0xF0 == 0x30;
            let length = if with_dts { 10 } else { 5 };
            if data.len() < pos + length {
                return Err(too_short(pos + length, data));
            }
            let timestamps = decode_timestamps(&data[pos..], with_dts)?;
            pos += length;
            timestamps
        }
        _ if byte == 0x0F => {
            pos += 1;
            (None, None)
        }
        _ => return Err(MalformedHeaderError::Mpeg1Marker(byte)),
    };

    Ok(PesHeader {
        stream_id,
        packet_length,
        syntax: PesSyntax::Mpeg1,
        scrambling_control: 0,
        priority: false,
        data_alignment: false,
        pts,
        dts,
        header_length: pos,
    })
}

/// Length of the private stream 1 substream header that precedes the
/// elementary data in a program stream, substream id byte included.
pub fn substream_header_len(substream_id: u8) -> usize {
    match substream_id {
        // subpicture: id only
        0x20..=0x3F => 1,
        // AC-3 and DTS: id, frame count, first access unit pointer
        0x80..=0x8F => 4,
        // LPCM: additionally emphasis, quantization and dynamic range bytes
        0xA0..=0xAF => 7,
        _ => 1,
    }
}

/// Substream id of a private stream 1 packet: the first payload byte
pub fn substream_id(data: &[u8], header: &PesHeader) -> Option<u8> {
    if header.stream_id != stream_id::PRIVATE_STREAM_1 {
        return None;
    }
    data.get(header.header_length).copied()
}
