//! # PES Reassembler
//!
//! Collects the payload fragments of one container stream into whole PES
//! units. A unit opens at a payload-start fragment and closes at the next
//! one, once its declared length is reached, or when the stream is drained
//! at the end of the input.
//!
//! Fragments are kept as [`Bytes`] slices of the reader buffer and only
//! concatenated when a unit spans more than one of them.

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tracing::{debug, trace};

use crate::Result;
use crate::scanner::{ContainerPacket, ContainerStreamId, PacketAnomaly};

/// Why a PES unit ended before all of its data was seen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationCause {
    /// An unbounded unit was still open when the input ended
    EndOfInputOpen,
    /// The input ended inside a container packet of an unbounded unit
    CutAtEndOfInput,
    /// Fewer bytes arrived than the length field announced
    ShortOfDeclared,
}

/// One reassembled PES packet, header included
#[derive(Debug, Clone)]
pub struct PesUnit {
    pub stream: ContainerStreamId,
    /// Offset of the container packet the unit started in
    pub offset: u64,
    /// `PES_packet_length`; `None` for unbounded units
    pub declared_length: Option<u16>,
    pub data: Bytes,
    pub truncated: Option<TruncationCause>,
    /// Container packets were lost while the unit was open
    pub gap: bool,
    pub random_access: bool,
    /// Bytes after the declared end that were dropped
    pub dropped_bytes: usize,
}

#[derive(Debug)]
struct OpenUnit {
    stream: ContainerStreamId,
    offset: u64,
    fragments: Vec<Bytes>,
    collected: usize,
    /// Length field, once the first six bytes have arrived
    length_field: Option<u16>,
    gap: bool,
    random_access: bool,
    /// A fragment was cut short by the end of the input
    cut: bool,
}

impl OpenUnit {
    fn new(packet: ContainerPacket) -> Self {
        let mut unit = Self {
            stream: packet.stream,
            offset: packet.offset,
            fragments: Vec::with_capacity(4),
            collected: 0,
            length_field: None,
            gap: false,
            random_access: packet.random_access,
            cut: false,
        };
        unit.append(packet);
        unit
    }

    fn append(&mut self, packet: ContainerPacket) {
        self.cut |= packet.anomalies.contains(&PacketAnomaly::Truncated);
        let fragment = packet.payload;
        if fragment.is_empty() {
            return;
        }
        self.collected += fragment.len();
        self.fragments.push(fragment);
        if self.length_field.is_none() && self.collected >= 6 {
            let mut head = [0u8; 6];
            for (dst, src) in head
                .iter_mut()
                .zip(self.fragments.iter().flat_map(|f| f.iter()))
            {
                *dst = *src;
            }
            self.length_field = Some(u16::from_be_bytes([head[4], head[5]]));
        }
    }

    /// Full unit size announced by the length field
    fn declared_total(&self) -> Option<usize> {
        match self.length_field {
            Some(0) | None => None,
            Some(length) => Some(6 + length as usize),
        }
    }

    fn into_unit(self, truncated: Option<TruncationCause>) -> PesUnit {
        let declared_total = self.declared_total();
        let mut data = if self.fragments.len() == 1 {
            self.fragments.into_iter().next().unwrap_or_default()
        } else {
            let mut joined = BytesMut::with_capacity(self.collected);
            for fragment in &self.fragments {
                joined.extend_from_slice(fragment);
            }
            joined.freeze()
        };
        let mut dropped_bytes = 0;
        if let Some(total) = declared_total.filter(|&total| data.len() > total) {
            dropped_bytes = data.len() - total;
            data.truncate(total);
        }
        PesUnit {
            stream: self.stream,
            offset: self.offset,
            declared_length: self.length_field.filter(|&l| l != 0),
            data,
            truncated,
            gap: self.gap,
            random_access: self.random_access,
            dropped_bytes,
        }
    }

    /// Cause to report when the unit is closed before completing
    fn shortfall(&self, at_end_of_input: bool) -> Option<TruncationCause> {
        match self.declared_total() {
            Some(total) if self.collected < total => Some(TruncationCause::ShortOfDeclared),
            Some(_) => None,
            // A header too short to hold the length field is short as well
            None if self.length_field.is_none() => Some(TruncationCause::ShortOfDeclared),
            None if self.cut => Some(TruncationCause::CutAtEndOfInput),
            None if at_end_of_input => Some(TruncationCause::EndOfInputOpen),
            None => None,
        }
    }
}

/// Reassembly state of one container stream
#[derive(Debug, Default)]
pub struct Reassembler {
    open: Option<OpenUnit>,
    orphans: u64,
    orphan_bytes: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a unit is currently being collected
    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Non-start fragments that arrived with no open unit
    pub fn orphans(&self) -> u64 {
        self.orphans
    }

    pub fn orphan_bytes(&self) -> u64 {
        self.orphan_bytes
    }

    /// Feeds one fragment and emits every unit it completes.
    pub fn push(
        &mut self,
        packet: ContainerPacket,
        output: &mut dyn FnMut(PesUnit) -> Result<()>,
    ) -> Result<()> {
        let gap = packet.has_gap();
        if packet.payload_start {
            if let Some(mut previous) = self.open.take() {
                // Packets lost before this start belonged to the previous unit
                previous.gap |= gap;
                let truncated = previous.shortfall(false);
                output(previous.into_unit(truncated))?;
            }
            self.open = Some(OpenUnit::new(packet));
            return self.complete(output);
        }

        match &mut self.open {
            Some(open) => {
                open.gap |= gap;
                open.append(packet);
                self.complete(output)
            }
            None => {
                self.orphans += 1;
                self.orphan_bytes += packet.payload.len() as u64;
                trace!(
                    stream = %packet.stream,
                    offset = packet.offset,
                    bytes = packet.payload.len(),
                    "dropping fragment without an open unit"
                );
                Ok(())
            }
        }
    }

    /// Emits the open unit if its declared length has been reached
    fn complete(&mut self, output: &mut dyn FnMut(PesUnit) -> Result<()>) -> Result<()> {
        let done = self.open.as_ref().is_some_and(|open| {
            open.declared_total()
                .is_some_and(|total| open.collected >= total)
        });
        if !done {
            return Ok(());
        }
        if let Some(open) = self.open.take() {
            let unit = open.into_unit(None);
            if unit.dropped_bytes > 0 {
                debug!(
                    stream = %unit.stream,
                    offset = unit.offset,
                    dropped = unit.dropped_bytes,
                    "dropping bytes past the declared PES length"
                );
            }
            output(unit)?;
        }
        Ok(())
    }

    /// Force-closes the open unit at the end of the input.
    pub fn drain(&mut self, output: &mut dyn FnMut(PesUnit) -> Result<()>) -> Result<()> {
        if let Some(open) = self.open.take() {
            let truncated = open.shortfall(true);
            output(open.into_unit(truncated))?;
        }
        Ok(())
    }

    /// Drops the open unit without emitting it
    pub fn discard(&mut self) -> bool {
        self.open.take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::PacketAnomaly;
    use crate::test_utils::pes_packet;

    fn fragment(data: &[u8], start: bool, offset: u64) -> ContainerPacket {
        ContainerPacket {
            stream: ContainerStreamId::Pid(0x100),
            continuity_counter: None,
            payload_start: start,
            payload: Bytes::copy_from_slice(data),
            offset,
            anomalies: Vec::new(),
            random_access: false,
        }
    }

    fn feed(reassembler: &mut Reassembler, packets: Vec<ContainerPacket>) -> Vec<PesUnit> {
        let mut units = Vec::new();
        for packet in packets {
            reassembler
                .push(packet, &mut |unit| {
                    units.push(unit);
                    Ok(())
                })
                .unwrap();
        }
        units
    }

    fn drain(reassembler: &mut Reassembler) -> Vec<PesUnit> {
        let mut units = Vec::new();
        reassembler
            .drain(&mut |unit| {
                units.push(unit);
                Ok(())
            })
            .unwrap();
        units
    }

    #[test]
    fn test_bounded_unit_closes_at_declared_length() {
        let pes = pes_packet(0xC0, Some(0), None, &[0x81; 300], true);
        let mut reassembler = Reassembler::new();
        let units = feed(
            &mut reassembler,
            vec![fragment(&pes[..184], true, 0), fragment(&pes[184..], false, 188)],
        );
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].data, pes);
        assert_eq!(units[0].declared_length, Some(308));
        assert_eq!(units[0].truncated, None);
        assert!(!reassembler.is_open());
    }

    #[test]
    fn test_excess_bytes_are_dropped() {
        let mut pes = pes_packet(0xC0, None, None, &[0x81; 20], true);
        let expected = pes.clone();
        pes.extend_from_slice(&[0xEE; 5]);
        let mut reassembler = Reassembler::new();
        let units = feed(&mut reassembler, vec![fragment(&pes, true, 0)]);
        assert_eq!(units[0].data, expected);
        assert_eq!(units[0].dropped_bytes, 5);
    }

    #[test]
    fn test_unbounded_unit_closes_at_next_start() {
        let first = pes_packet(0xE0, Some(0), None, &[0x80; 200], false);
        let second = pes_packet(0xE0, Some(3600), None, &[0x80; 10], false);
        let mut reassembler = Reassembler::new();
        let units = feed(
            &mut reassembler,
            vec![
                fragment(&first[..100], true, 0),
                fragment(&first[100..], false, 188),
                fragment(&second, true, 376),
            ],
        );
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].data, first);
        assert_eq!(units[0].declared_length, None);
        assert_eq!(units[0].truncated, None);

        let rest = drain(&mut reassembler);
        assert_eq!(rest[0].data, second);
        assert_eq!(rest[0].truncated, Some(TruncationCause::EndOfInputOpen));
        assert_eq!(rest[0].offset, 376);
    }

    #[test]
    fn test_unbounded_unit_cut_by_end_of_input() {
        let pes = pes_packet(0xE0, Some(0), None, &[0x80; 400], false);
        let mut cut = fragment(&pes[184..250], false, 188);
        cut.anomalies.push(PacketAnomaly::Truncated);
        let mut reassembler = Reassembler::new();
        feed(&mut reassembler, vec![fragment(&pes[..184], true, 0), cut]);
        let units = drain(&mut reassembler);
        assert_eq!(units[0].truncated, Some(TruncationCause::CutAtEndOfInput));
        assert_eq!(units[0].data, pes[..250]);
    }

    #[test]
    fn test_short_bounded_unit() {
        let pes = pes_packet(0xC0, Some(0), None, &[0x81; 300], true);
        let next = pes_packet(0xC0, Some(0), None, &[0x81; 10], true);
        let mut reassembler = Reassembler::new();
        let units = feed(
            &mut reassembler,
            vec![fragment(&pes[..184], true, 0), fragment(&next, true, 188)],
        );
        assert_eq!(units[0].truncated, Some(TruncationCause::ShortOfDeclared));
        assert_eq!(units[0].data.len(), 184);
        assert_eq!(units[1].truncated, None);

        let mut reassembler = Reassembler::new();
        feed(&mut reassembler, vec![fragment(&pes[..100], true, 0)]);
        let units = drain(&mut reassembler);
        assert_eq!(units[0].truncated, Some(TruncationCause::ShortOfDeclared));
    }

    #[test]
    fn test_orphans_and_gaps() {
        let pes = pes_packet(0xE0, None, None, &[0x80; 400], false);
        let mut reassembler = Reassembler::new();
        let mut lost = fragment(&pes[200..], false, 376);
        lost.anomalies
            .push(PacketAnomaly::ContinuityGap { expected: 1, found: 2 });
        let units = feed(
            &mut reassembler,
            vec![
                fragment(&[0x80; 50], false, 0),
                fragment(&pes[..100], true, 188),
                lost,
            ],
        );
        assert!(units.is_empty());
        assert_eq!(reassembler.orphans(), 1);
        assert_eq!(reassembler.orphan_bytes(), 50);

        let units = drain(&mut reassembler);
        assert!(units[0].gap);
        assert_eq!(units[0].data.len(), 100 + pes.len() - 200);
    }

    #[test]
    fn test_gap_on_start_marks_previous_unit() {
        let first = pes_packet(0xE0, None, None, &[0x80; 50], false);
        let mut next = fragment(&first, true, 376);
        next.anomalies
            .push(PacketAnomaly::ContinuityGap { expected: 1, found: 3 });
        let mut reassembler = Reassembler::new();
        let units = feed(&mut reassembler, vec![fragment(&first, true, 0), next]);
        assert!(units[0].gap);
        let rest = drain(&mut reassembler);
        assert!(!rest[0].gap);
    }

    #[test]
    fn test_discard_drops_open_unit() {
        let pes = pes_packet(0xE0, None, None, &[0x80; 50], false);
        let mut reassembler = Reassembler::new();
        feed(&mut reassembler, vec![fragment(&pes, true, 0)]);
        assert!(reassembler.discard());
        assert!(drain(&mut reassembler).is_empty());
    }
}
