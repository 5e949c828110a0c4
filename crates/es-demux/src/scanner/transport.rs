use std::collections::HashMap;
use std::io::{Read, Seek};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};
use ts::{
    ElementaryStreamInfo, PID_NULL, PacketLayout, PsiTracker, SYNC_BYTE, TS_PACKET_SIZE, TsPacket,
};

use super::{ContainerPacket, ContainerStreamId, PacketAnomaly, Resync, ScanEvent, resync};
use crate::{BitstreamReader, DemuxConfig, DesyncError, Result};

/// Transport stream engine of the container scanner
pub(crate) struct TransportScanner {
    layout: PacketLayout,
    psi: PsiTracker,
    /// Last continuity counter seen with a payload, per PID
    continuity: HashMap<u16, u8>,
    /// A resync window ran out and the search goes on
    resyncing: bool,
}

impl TransportScanner {
    pub(crate) fn new(layout: PacketLayout) -> Self {
        Self {
            layout,
            psi: PsiTracker::new(),
            continuity: HashMap::new(),
            resyncing: false,
        }
    }

    pub(crate) fn declared_stream(&self, pid: u16) -> Option<&ElementaryStreamInfo> {
        self.psi.stream_info(pid)
    }

    pub(crate) fn has_program_map(&self) -> bool {
        self.psi.has_program_map()
    }

    pub(crate) fn reset_continuity(&mut self) {
        self.continuity.clear();
        self.resyncing = false;
    }

    pub(crate) fn next_event<R: Read + Seek>(
        &mut self,
        reader: &mut BitstreamReader<R>,
        config: &DemuxConfig,
    ) -> Result<Option<ScanEvent>> {
        let stride = self.layout.stride();
        let sync_offset = self.layout.sync_offset();
        loop {
            let available = reader.fill(stride)?;
            if available == 0 {
                return Ok(None);
            }
            let in_sync = !self.resyncing
                && available > sync_offset
                && reader.buffered()[sync_offset] == SYNC_BYTE;

            if !in_sync {
                if let Some(event) = self.resync(reader, config)? {
                    return Ok(Some(event));
                }
                continue;
            }

            let offset = reader.position();
            let (packet, truncated) = if available >= stride {
                let record = reader.take(stride);
                (
                    TsPacket::parse(record.slice(sync_offset..sync_offset + TS_PACKET_SIZE)),
                    None,
                )
            } else {
                // The input ends inside this record
                let record = reader.take(available);
                let present = (available - sync_offset).min(TS_PACKET_SIZE);
                let mut padded = BytesMut::with_capacity(TS_PACKET_SIZE);
                padded.extend_from_slice(&record[sync_offset..sync_offset + present]);
                padded.resize(TS_PACKET_SIZE, 0xFF);
                (TsPacket::parse(padded.freeze()), Some(present))
            };

            let packet = match packet {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(offset, error = %e, "dropping unparsable transport packet");
                    continue;
                }
            };

            if let Some(packet) = self.process(packet, offset, truncated) {
                return Ok(Some(ScanEvent::Packet(packet)));
            }
        }
    }

    fn resync<R: Read + Seek>(
        &mut self,
        reader: &mut BitstreamReader<R>,
        config: &DemuxConfig,
    ) -> Result<Option<ScanEvent>> {
        let offset = reader.position();
        let layout = self.layout;
        let confirm = config.resync_confirmations;
        let lookahead = layout.stride() * (confirm + 1);
        let outcome = resync(reader, config, self.resyncing, lookahead, |data| {
            ts::find_sync(data, layout, confirm)
        })?;

        let skipped = match outcome {
            Resync::Found { skipped } => {
                self.resyncing = false;
                skipped
            }
            Resync::WindowExhausted { skipped } => {
                self.resyncing = true;
                skipped
            }
            Resync::EndOfInput { skipped } => {
                self.resyncing = false;
                skipped
            }
        };
        if skipped == 0 {
            return Ok(None);
        }
        warn!(offset, skipped, "transport stream sync lost");
        Ok(Some(ScanEvent::Desync(DesyncError { offset, skipped })))
    }

    /// Turns a parsed packet into a container packet, or swallows it.
    fn process(
        &mut self,
        packet: TsPacket,
        offset: u64,
        truncated: Option<usize>,
    ) -> Option<ContainerPacket> {
        let pid = packet.pid;
        if pid == PID_NULL {
            return None;
        }
        if self.psi.is_psi_pid(pid) {
            match self.psi.process_packet(&packet) {
                Ok(true) => debug!(pid, streams = self.psi.stream_count(), "program tables updated"),
                Ok(false) => {}
                Err(e) => debug!(pid, offset, error = %e, "skipping PSI section"),
            }
            return None;
        }

        let mut anomalies = Vec::new();
        if packet.transport_error_indicator {
            anomalies.push(PacketAnomaly::TransportError);
        }
        let discontinuity = packet.discontinuity_indicator();
        if discontinuity {
            anomalies.push(PacketAnomaly::Discontinuity);
        }

        if !packet.has_payload() {
            if discontinuity {
                self.continuity.remove(&pid);
            }
            return None;
        }

        let cc = packet.continuity_counter;
        match self.continuity.insert(pid, cc) {
            Some(last) if last == cc && !discontinuity => {
                trace!(pid, cc, offset, "dropping duplicate packet");
                return None;
            }
            Some(last) if !discontinuity => {
                let expected = (last + 1) & 0x0F;
                if cc != expected {
                    anomalies.push(PacketAnomaly::ContinuityGap { expected, found: cc });
                }
            }
            _ => {}
        }

        let mut payload: Bytes = packet.payload()?;
        if let Some(present) = truncated {
            // Drop the padding added to parse the short packet
            let header = TS_PACKET_SIZE - payload.len();
            payload.truncate(present.saturating_sub(header));
            anomalies.push(PacketAnomaly::Truncated);
        }

        Some(ContainerPacket {
            stream: ContainerStreamId::Pid(pid),
            continuity_counter: Some(cc),
            payload_start: packet.payload_unit_start_indicator,
            payload,
            offset,
            anomalies,
            random_access: packet.random_access_indicator(),
        })
    }
}
