use std::io::{Read, Seek};

use tracing::{trace, warn};

use super::{
    ContainerPacket, ContainerStreamId, PacketAnomaly, Resync, ScanEvent, find_start_code, resync,
};
use crate::pes::{self, stream_id};
use crate::{BitstreamReader, DemuxConfig, DesyncError, Result};

const PACK_START: u8 = 0xBA;
const SYSTEM_HEADER: u8 = 0xBB;
const PROGRAM_END: u8 = 0xB9;

/// Smallest read used while following an unbounded PES packet
const MIN_UNBOUNDED_CHUNK: usize = 4096;

/// Where a chunk of an unbounded PES packet stops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkEnd {
    /// Before the start code of the next packet
    StartCode,
    /// The packet goes on past the buffered data
    More,
    /// The input ended with no start code after the packet
    EndOfInput,
}

/// Program stream engine of the container scanner.
///
/// Each PES packet is yielded whole as one payload-start container packet.
/// A PES packet with a zero length field is yielded in chunks that end
/// before the next start code. Such a packet running into the end of the
/// input is tagged as truncated, since a program stream closes with an end
/// code or another pack.
pub(crate) struct ProgramScanner {
    /// Stream whose unbounded PES packet is still being read
    unbounded: Option<ContainerStreamId>,
    resyncing: bool,
}

/// Container stream of a PES packet, including the private stream 1
/// substream id when the header can be read
fn stream_of(data: &[u8]) -> ContainerStreamId {
    let id = data[3];
    let substream = if id == stream_id::PRIVATE_STREAM_1 {
        pes::parse_header(data)
            .ok()
            .and_then(|header| pes::substream_id(data, &header))
    } else {
        None
    };
    ContainerStreamId::StreamId {
        stream_id: id,
        substream,
    }
}

fn cut_anomalies(chunk_end: ChunkEnd) -> Vec<PacketAnomaly> {
    match chunk_end {
        ChunkEnd::EndOfInput => vec![PacketAnomaly::Truncated],
        ChunkEnd::StartCode | ChunkEnd::More => Vec::new(),
    }
}

impl ProgramScanner {
    pub(crate) fn new() -> Self {
        Self {
            unbounded: None,
            resyncing: false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.unbounded = None;
        self.resyncing = false;
    }

    pub(crate) fn next_event<R: Read + Seek>(
        &mut self,
        reader: &mut BitstreamReader<R>,
        config: &DemuxConfig,
    ) -> Result<Option<ScanEvent>> {
        loop {
            if let Some(stream) = self.unbounded {
                match self.continue_unbounded(reader, config, stream)? {
                    Some(packet) => return Ok(Some(ScanEvent::Packet(packet))),
                    None => continue,
                }
            }

            let available = reader.fill(4)?;
            if available == 0 {
                return Ok(None);
            }
            let head = reader.buffered();
            let synced = !self.resyncing
                && available >= 4
                && head[..3] == [0x00, 0x00, 0x01]
                && head[3] >= PROGRAM_END;
            if !synced {
                if let Some(event) = self.resync(reader, config)? {
                    return Ok(Some(event));
                }
                continue;
            }

            let id = head[3];
            match id {
                PROGRAM_END => reader.consume(4),
                PACK_START => match pack_header_len(reader)? {
                    Some(length) => reader.consume(length),
                    None => {
                        // Not a valid pack header after all
                        self.resyncing = false;
                        if let Some(event) = self.resync(reader, config)? {
                            return Ok(Some(event));
                        }
                    }
                },
                SYSTEM_HEADER => {
                    let available = reader.fill(6)?;
                    let length = if available >= 6 {
                        let buf = reader.buffered();
                        6 + u16::from_be_bytes([buf[4], buf[5]]) as usize
                    } else {
                        available
                    };
                    let available = reader.fill(length)?;
                    reader.consume(length.min(available));
                }
                _ => {
                    if let Some(packet) = self.read_pes(reader, config)? {
                        return Ok(Some(ScanEvent::Packet(packet)));
                    }
                }
            }
        }
    }

    fn read_pes<R: Read + Seek>(
        &mut self,
        reader: &mut BitstreamReader<R>,
        config: &DemuxConfig,
    ) -> Result<Option<ContainerPacket>> {
        let offset = reader.position();
        let available = reader.fill(6)?;
        if available < 6 {
            trace!(offset, "incomplete PES packet header at end of input");
            reader.consume(available);
            return Ok(None);
        }
        let buf = reader.buffered();
        let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        if length == 0 {
            return self.start_unbounded(reader, config);
        }

        let total = 6 + length;
        let available = reader.fill(total)?;
        let stream = stream_of(&reader.buffered()[..available.min(total)]);
        let mut anomalies = Vec::new();
        if available < total {
            anomalies.push(PacketAnomaly::Truncated);
        }
        let payload = reader.take(total);
        Ok(Some(ContainerPacket {
            stream,
            continuity_counter: None,
            payload_start: true,
            payload,
            offset,
            anomalies,
            random_access: false,
        }))
    }

    fn unbounded_chunk<R: Read + Seek>(
        reader: &mut BitstreamReader<R>,
        config: &DemuxConfig,
        search_from: usize,
    ) -> Result<(usize, ChunkEnd)> {
        let want = config
            .read_chunk_size
            .max(MIN_UNBOUNDED_CHUNK)
            .min(reader.max_lookahead());
        let available = reader.fill(want)?;
        let buf = &reader.buffered()[..available];
        let from = search_from.min(available);
        match find_start_code(&buf[from..]) {
            Some(pos) => Ok((from + pos, ChunkEnd::StartCode)),
            None if available < want => Ok((available, ChunkEnd::EndOfInput)),
            // Keep a possible partial start code for the next round
            None => Ok((available - 3, ChunkEnd::More)),
        }
    }

    fn start_unbounded<R: Read + Seek>(
        &mut self,
        reader: &mut BitstreamReader<R>,
        config: &DemuxConfig,
    ) -> Result<Option<ContainerPacket>> {
        let offset = reader.position();
        let (end, chunk_end) = Self::unbounded_chunk(reader, config, 6)?;
        let stream = stream_of(&reader.buffered()[..end]);
        if chunk_end == ChunkEnd::More {
            self.unbounded = Some(stream);
        }
        Ok(Some(ContainerPacket {
            stream,
            continuity_counter: None,
            payload_start: true,
            payload: reader.take(end),
            offset,
            anomalies: cut_anomalies(chunk_end),
            random_access: false,
        }))
    }

    fn continue_unbounded<R: Read + Seek>(
        &mut self,
        reader: &mut BitstreamReader<R>,
        config: &DemuxConfig,
        stream: ContainerStreamId,
    ) -> Result<Option<ContainerPacket>> {
        let offset = reader.position();
        let (end, chunk_end) = Self::unbounded_chunk(reader, config, 0)?;
        if chunk_end != ChunkEnd::More {
            self.unbounded = None;
        }
        // An empty chunk still carries the cut mark to the open unit
        if end == 0 && chunk_end != ChunkEnd::EndOfInput {
            return Ok(None);
        }
        Ok(Some(ContainerPacket {
            stream,
            continuity_counter: None,
            payload_start: false,
            payload: reader.take(end),
            offset,
            anomalies: cut_anomalies(chunk_end),
            random_access: false,
        }))
    }

    fn resync<R: Read + Seek>(
        &mut self,
        reader: &mut BitstreamReader<R>,
        config: &DemuxConfig,
    ) -> Result<Option<ScanEvent>> {
        let offset = reader.position();
        let skipped = match resync(reader, config, self.resyncing, 4, find_start_code)? {
            Resync::Found { skipped } | Resync::EndOfInput { skipped } => {
                self.resyncing = false;
                skipped
            }
            Resync::WindowExhausted { skipped } => {
                self.resyncing = true;
                skipped
            }
        };
        if skipped == 0 {
            return Ok(None);
        }
        warn!(offset, skipped, "program stream sync lost");
        Ok(Some(ScanEvent::Desync(DesyncError { offset, skipped })))
    }
}

/// Size of the pack header at the cursor, or `None` if it is not a valid
/// MPEG-1 or MPEG-2 pack header
fn pack_header_len<R: Read + Seek>(reader: &mut BitstreamReader<R>) -> Result<Option<usize>> {
    let available = reader.fill(14)?;
    let buf = reader.buffered();
    if available < 5 {
        return Ok(None);
    }
    let length = if buf[4] & 0xC0 == 0x40 {
        if available < 14 {
            return Ok(None);
        }
        14 + (buf[13] & 0x07) as usize
    } else if buf[4] & 0xF0 == 0x20 {
        12
    } else {
        return Ok(None);
    };
    Ok(Some(length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{ContainerFormat, ContainerScanner};
    use crate::test_utils::{PsBuilder, pes_packet};
    use std::io::Cursor;

    fn scan(data: Vec<u8>) -> Vec<ScanEvent> {
        scan_with(data, &DemuxConfig::default())
    }

    fn scan_with(data: Vec<u8>, config: &DemuxConfig) -> Vec<ScanEvent> {
        let reader = BitstreamReader::new(Cursor::new(data), config).unwrap();
        ContainerScanner::with_format(reader, config, ContainerFormat::Program)
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    fn packets(events: &[ScanEvent]) -> Vec<&ContainerPacket> {
        events
            .iter()
            .filter_map(|e| match e {
                ScanEvent::Packet(p) => Some(p),
                ScanEvent::Desync(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_packs_system_header_and_end_code() {
        let video = pes_packet(0xE0, Some(3600), None, &[0x80; 500], true);
        let mut ps = PsBuilder::new();
        ps.add_system_header();
        ps.add_pes(&video);
        ps.add_mpeg1_pack();
        ps.add_pes(&pes_packet(0xC0, Some(3600), None, &[0x81; 100], true));
        ps.add_end_code();

        let events = scan(ps.build());
        let packets = packets(&events);
        assert_eq!(events.len(), 2);
        assert_eq!(packets[0].payload, video);
        assert!(packets[0].payload_start);
        assert_eq!(packets[0].offset, 14 + 18);
        assert_eq!(
            packets[1].stream,
            ContainerStreamId::StreamId {
                stream_id: 0xC0,
                substream: None
            }
        );
    }

    #[test]
    fn test_private_stream_substreams() {
        let mut ps = PsBuilder::new();
        ps.add_pes(&pes_packet(0xBD, Some(0), None, &[0x20, 0x80, 0x81], true));
        ps.add_pes(&pes_packet(0xBD, Some(0), None, &[0x80, 1, 0, 1, 0x0B, 0x77], true));
        let events = scan(ps.build());
        let streams: Vec<_> = packets(&events).iter().map(|p| p.stream).collect();
        assert_eq!(
            streams,
            vec![
                ContainerStreamId::StreamId {
                    stream_id: 0xBD,
                    substream: Some(0x20)
                },
                ContainerStreamId::StreamId {
                    stream_id: 0xBD,
                    substream: Some(0x80)
                },
            ]
        );
    }

    #[test]
    fn test_unbounded_pes_ends_at_next_start_code() {
        let mut ps = PsBuilder::new();
        let video = pes_packet(0xE0, Some(0), None, &[0x80; 10_000], false);
        ps.add_pes(&video);
        ps.add_pes(&pes_packet(0xC0, Some(0), None, &[0x81; 10], true));
        let config = DemuxConfig {
            read_chunk_size: 1024,
            ..DemuxConfig::default()
        };
        let events = scan_with(ps.build(), &config);
        let packets = packets(&events);

        let video_chunks: Vec<_> = packets
            .iter()
            .filter(|p| p.stream.label() == "e0")
            .collect();
        assert!(video_chunks.len() > 1);
        assert!(video_chunks[0].payload_start);
        assert!(video_chunks[1..].iter().all(|p| !p.payload_start));
        let joined: Vec<u8> = video_chunks
            .iter()
            .flat_map(|p| p.payload.iter().copied())
            .collect();
        assert_eq!(joined, video);
        assert_eq!(packets.last().unwrap().stream.label(), "c0");
    }

    #[test]
    fn test_truncated_final_packet() {
        let mut ps = PsBuilder::new();
        ps.add_pes(&pes_packet(0xC0, Some(0), None, &[0x81; 300], true));
        let mut data = ps.build();
        data.truncate(data.len() - 100);
        let events = scan(data);
        let packets = packets(&events);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].anomalies, vec![PacketAnomaly::Truncated]);
        assert_eq!(packets[0].payload.len(), 314 - 100);
    }

    #[test]
    fn test_unbounded_pes_running_into_end_of_input() {
        let mut ps = PsBuilder::new();
        let video = pes_packet(0xE0, Some(0), None, &[0x80; 10_000], false);
        ps.add_pes(&video);
        let config = DemuxConfig {
            read_chunk_size: 1024,
            ..DemuxConfig::default()
        };
        let events = scan_with(ps.build(), &config);
        let packets = packets(&events);
        let last = packets.last().unwrap();
        assert_eq!(last.anomalies, vec![PacketAnomaly::Truncated]);
        assert!(
            packets[..packets.len() - 1]
                .iter()
                .all(|p| p.anomalies.is_empty())
        );

        let mut ps = PsBuilder::new();
        ps.add_pes(&video).add_end_code();
        let events = scan_with(ps.build(), &config);
        assert!(self::packets(&events).iter().all(|p| p.anomalies.is_empty()));
    }

    #[test]
    fn test_garbage_between_packets() {
        let mut ps = PsBuilder::new();
        ps.add_pes(&pes_packet(0xC0, Some(0), None, &[0x81; 50], true));
        ps.add_raw(&[0x12; 77]);
        ps.add_pes(&pes_packet(0xC0, Some(3600), None, &[0x81; 50], true));
        let events = scan(ps.build());
        let desyncs: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ScanEvent::Desync(d) => Some(d.skipped),
                _ => None,
            })
            .collect();
        assert_eq!(desyncs, vec![77]);
        assert_eq!(packets(&events).len(), 2);
    }
}
