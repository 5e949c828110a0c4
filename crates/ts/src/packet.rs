use crate::{Result, TsError};
use bytes::{Buf, Bytes};
use memchr::memchr;

/// Size of a transport stream packet without any framing
pub const TS_PACKET_SIZE: usize = 188;

/// Sync byte that starts every TS packet
pub const SYNC_BYTE: u8 = 0x47;

/// PAT PID (always 0x0000)
pub const PID_PAT: u16 = 0x0000;

/// NULL PID (always 0x1FFF)
pub const PID_NULL: u16 = 0x1FFF;

/// Record layouts that wrap a 188-byte TS packet on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketLayout {
    /// Plain 188-byte packets
    Standard,
    /// 192-byte packets with a 4-byte timecode prefix (M2TS / BDAV)
    M2ts,
    /// 204-byte packets with 16 trailing Reed-Solomon bytes
    Fec,
}

impl PacketLayout {
    /// Layouts in the order they are probed
    pub const ALL: [PacketLayout; 3] = [
        PacketLayout::Standard,
        PacketLayout::M2ts,
        PacketLayout::Fec,
    ];

    /// Distance between two consecutive records
    pub fn stride(self) -> usize {
        match self {
            PacketLayout::Standard => 188,
            PacketLayout::M2ts => 192,
            PacketLayout::Fec => 204,
        }
    }

    /// Offset of the sync byte inside a record
    pub fn sync_offset(self) -> usize {
        match self {
            PacketLayout::M2ts => 4,
            PacketLayout::Standard | PacketLayout::Fec => 0,
        }
    }
}

/// Counts consecutive records starting at `start` whose sync byte is in place.
/// Stops after `limit` records or at the end of `data`.
pub fn sync_run(data: &[u8], start: usize, layout: PacketLayout, limit: usize) -> usize {
    let mut run = 0;
    let mut pos = start + layout.sync_offset();
    while run < limit && pos < data.len() && data[pos] == SYNC_BYTE {
        run += 1;
        pos += layout.stride();
    }
    run
}

/// Finds the first record start in `data` confirmed by `confirm` further sync
/// bytes at the layout stride.
///
/// A candidate whose confirmations would lie past the end of `data` is
/// accepted as long as at least one confirmation is present and every
/// confirmation that is present matches. With `confirm == 0` a lone sync byte
/// is enough. Callers must buffer enough data before calling this in the
/// middle of a stream.
pub fn find_sync(data: &[u8], layout: PacketLayout, confirm: usize) -> Option<usize> {
    let sync_offset = layout.sync_offset();
    let stride = layout.stride();
    let mut from = sync_offset;

    while from < data.len() {
        let hit = from + memchr(SYNC_BYTE, &data[from..])?;
        let start = hit - sync_offset;
        let run = sync_run(data, start, layout, confirm + 1);
        let next_expected = start + sync_offset + run * stride;
        if run > confirm || (run > 1 && next_expected >= data.len()) {
            return Some(start);
        }
        from = hit + 1;
    }
    None
}

/// Guesses the record layout of a transport stream from its first bytes.
///
/// Returns the layout and the offset of the first record when at least
/// `packets` consecutive records (or every record in a shorter buffer) carry
/// a sync byte.
pub fn detect_layout(data: &[u8], packets: usize) -> Option<(PacketLayout, usize)> {
    let mut best: Option<(PacketLayout, usize)> = None;
    for layout in PacketLayout::ALL {
        let stride = layout.stride();
        let window = data.len().min(stride * 2);
        for start in 0..window {
            let available = data.len().saturating_sub(start) / stride;
            let needed = packets.min(available).max(1);
            if available == 0 {
                break;
            }
            if sync_run(data, start, layout, needed) == needed
                && (needed > 1 || (available == 1 && start == 0))
            {
                if best.is_none_or(|(_, offset)| start < offset) {
                    best = Some((layout, start));
                }
                break;
            }
        }
    }
    best
}

/// Transport Stream packet referencing its source bytes
#[derive(Debug, Clone)]
pub struct TsPacket {
    /// Source packet data (exactly 188 bytes)
    data: Bytes,
    /// Transport Error Indicator
    pub transport_error_indicator: bool,
    /// Payload Unit Start Indicator
    pub payload_unit_start_indicator: bool,
    /// Transport Priority
    pub transport_priority: bool,
    /// Packet Identifier
    pub pid: u16,
    /// Transport Scrambling Control
    pub transport_scrambling_control: u8,
    /// Adaptation Field Control
    pub adaptation_field_control: u8,
    /// Continuity Counter
    pub continuity_counter: u8,
    adaptation_field_offset: Option<usize>,
    payload_offset: Option<usize>,
}

impl TsPacket {
    /// Parse a TS packet from exactly 188 bytes
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() != TS_PACKET_SIZE {
            return Err(TsError::InvalidPacketSize(data.len()));
        }
        let mut reader = &data[..];
        let sync_byte = reader.get_u8();
        if sync_byte != SYNC_BYTE {
            return Err(TsError::InvalidSyncByte(sync_byte));
        }
        let byte1 = reader.get_u8();
        let byte2 = reader.get_u8();
        let byte3 = reader.get_u8();

        let transport_error_indicator = (byte1 & 0x80) != 0;
        let payload_unit_start_indicator = (byte1 & 0x40) != 0;
        let transport_priority = (byte1 & 0x20) != 0;
        let pid = ((byte1 as u16 & 0x1F) << 8) | byte2 as u16;
        let transport_scrambling_control = (byte3 >> 6) & 0x03;
        let adaptation_field_control = (byte3 >> 4) & 0x03;
        let continuity_counter = byte3 & 0x0F;

        let mut offset = 4;
        let mut adaptation_field_offset = None;
        let mut payload_offset = None;

        if adaptation_field_control & 0x02 != 0 {
            let adaptation_field_length = data[offset];
            // 183 bytes is the most an adaptation field can take
            if adaptation_field_length as usize > TS_PACKET_SIZE - 5 {
                return Err(TsError::InvalidAdaptationFieldLength(adaptation_field_length));
            }
            adaptation_field_offset = Some(offset);
            offset += 1 + adaptation_field_length as usize;
        }

        if adaptation_field_control & 0x01 != 0 && offset < TS_PACKET_SIZE {
            payload_offset = Some(offset);
        }

        Ok(TsPacket {
            data,
            transport_error_indicator,
            payload_unit_start_indicator,
            transport_priority,
            pid,
            transport_scrambling_control,
            adaptation_field_control,
            continuity_counter,
            adaptation_field_offset,
            payload_offset,
        })
    }

    /// Check if this packet carries payload bytes
    #[inline]
    pub fn has_payload(&self) -> bool {
        self.payload_offset.is_some()
    }

    /// Adaptation field bytes, without the length byte
    #[inline]
    pub fn adaptation_field(&self) -> Option<Bytes> {
        let offset = self.adaptation_field_offset?;
        let length = self.data[offset] as usize;
        Some(self.data.slice(offset + 1..offset + 1 + length))
    }

    /// Payload bytes after the header and adaptation field
    #[inline]
    pub fn payload(&self) -> Option<Bytes> {
        self.payload_offset.map(|offset| self.data.slice(offset..))
    }

    /// PSI payload (removes pointer field if PUSI is set)
    pub fn psi_payload(&self) -> Option<Bytes> {
        let payload = self.payload()?;
        if self.payload_unit_start_indicator && !payload.is_empty() {
            let pointer_field = payload[0] as usize;
            if 1 + pointer_field < payload.len() {
                return Some(payload.slice(1 + pointer_field..));
            }
            None
        } else if !self.payload_unit_start_indicator {
            Some(payload)
        } else {
            None
        }
    }

    fn adaptation_flags(&self) -> u8 {
        self.adaptation_field()
            .and_then(|field| field.first().copied())
            .unwrap_or(0)
    }

    /// Discontinuity indicator from the adaptation field
    pub fn discontinuity_indicator(&self) -> bool {
        self.adaptation_flags() & 0x80 != 0
    }

    /// Random access indicator from the adaptation field
    pub fn random_access_indicator(&self) -> bool {
        self.adaptation_flags() & 0x40 != 0
    }

    /// The full 188 packet bytes
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }
}
