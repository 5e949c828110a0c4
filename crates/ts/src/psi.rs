use crate::{
    Result, StreamType, TsError,
    packet::{PID_PAT, TsPacket},
    pmt::descriptor_tags,
};
use bytes::{Buf, Bytes};
use std::collections::HashMap;
use tracing::debug;

/// Reads the common long-form section header and returns
/// `(section_length, table_id_extension, version_number)`.
fn section_header(
    data: &Bytes,
    table_id: u8,
    name: &'static str,
    min_length: u16,
) -> Result<(u16, u16, u8)> {
    if data.len() < 8 {
        return Err(TsError::InsufficientData {
            expected: 8,
            actual: data.len(),
        });
    }
    let mut reader = &data[..];
    let actual = reader.get_u8();
    if actual != table_id {
        return Err(TsError::InvalidTableId {
            expected: table_id,
            actual,
        });
    }
    let byte1 = reader.get_u8();
    if byte1 & 0x80 == 0 {
        return Err(TsError::MissingSectionSyntax(name));
    }
    let section_length = ((byte1 as u16 & 0x0F) << 8) | reader.get_u8() as u16;
    if section_length < min_length {
        return Err(TsError::InvalidSectionLength(section_length));
    }
    if data.len() < 3 + section_length as usize {
        return Err(TsError::InsufficientData {
            expected: 3 + section_length as usize,
            actual: data.len(),
        });
    }
    let extension = reader.get_u16();
    let version_number = (reader.get_u8() >> 1) & 0x1F;
    Ok((section_length, extension, version_number))
}

/// Zero-copy PAT section
#[derive(Debug, Clone)]
pub struct PatRef {
    data: Bytes,
    pub transport_stream_id: u16,
    pub version_number: u8,
    programs_end: usize,
}

impl PatRef {
    /// Parse PAT from PSI section data
    pub fn parse(data: Bytes) -> Result<Self> {
        let (section_length, transport_stream_id, version_number) =
            section_header(&data, 0x00, "PAT", 9)?;
        Ok(PatRef {
            transport_stream_id,
            version_number,
            // Exclude CRC32
            programs_end: 3 + section_length as usize - 4,
            data,
        })
    }

    /// Iterator over `(program_number, pmt_pid)` pairs without allocating
    pub fn programs(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.data[8..self.programs_end].chunks_exact(4).map(|entry| {
            let program_number = u16::from_be_bytes([entry[0], entry[1]]);
            let pid = ((entry[2] as u16 & 0x1F) << 8) | entry[3] as u16;
            (program_number, pid)
        })
    }
}

/// Zero-copy PMT section
#[derive(Debug, Clone)]
pub struct PmtRef {
    data: Bytes,
    pub program_number: u16,
    pub version_number: u8,
    pub pcr_pid: u16,
    streams_offset: usize,
    streams_end: usize,
}

impl PmtRef {
    /// Parse PMT from PSI section data
    pub fn parse(data: Bytes) -> Result<Self> {
        let (section_length, program_number, version_number) =
            section_header(&data, 0x02, "PMT", 13)?;
        let pcr_pid = ((data[8] as u16 & 0x1F) << 8) | data[9] as u16;
        let program_info_length = (((data[10] as u16) & 0x0F) << 8) | data[11] as u16;
        if (section_length as usize) < 9 + program_info_length as usize + 4 {
            return Err(TsError::InvalidSectionLength(section_length));
        }
        Ok(PmtRef {
            program_number,
            version_number,
            pcr_pid,
            streams_offset: 12 + program_info_length as usize,
            streams_end: 3 + section_length as usize - 4,
            data,
        })
    }

    /// Iterator over elementary stream entries
    pub fn streams(&self) -> PmtStreamIterator {
        PmtStreamIterator {
            data: self.data.slice(self.streams_offset..self.streams_end),
        }
    }
}

/// Iterator over PMT elementary stream entries
#[derive(Debug)]
pub struct PmtStreamIterator {
    data: Bytes,
}

impl Iterator for PmtStreamIterator {
    type Item = Result<PmtStreamRef>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.remaining() < 5 {
            return None;
        }
        let stream_type = StreamType::from(self.data.get_u8());
        let elementary_pid = self.data.get_u16() & 0x1FFF;
        let es_info_length = (self.data.get_u16() & 0x0FFF) as usize;
        if self.data.remaining() < es_info_length {
            let actual = self.data.remaining();
            self.data.advance(actual);
            return Some(Err(TsError::InsufficientData {
                expected: es_info_length,
                actual,
            }));
        }
        let es_info = self.data.split_to(es_info_length);
        Some(Ok(PmtStreamRef {
            stream_type,
            elementary_pid,
            es_info,
        }))
    }
}

/// PMT elementary stream entry
#[derive(Debug, Clone)]
pub struct PmtStreamRef {
    pub stream_type: StreamType,
    pub elementary_pid: u16,
    pub es_info: Bytes,
}

/// What a PMT declared about one elementary PID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementaryStreamInfo {
    pub program_number: u16,
    pub stream_type: StreamType,
    /// Tags of the ES info descriptors, in declaration order
    pub descriptor_tags: Vec<u8>,
}

impl ElementaryStreamInfo {
    pub fn has_descriptor(&self, tag: u8) -> bool {
        self.descriptor_tags.contains(&tag)
    }
}

/// Follows PAT/PMT versions and remembers the declared type of every
/// elementary PID.
///
/// Only sections that start and end inside one packet are decoded; PAT and
/// PMT sections of ordinary broadcasts fit.
#[derive(Debug, Default)]
pub struct PsiTracker {
    /// Reverse PMT PID lookup: pmt_pid -> program_number
    pmt_pids: HashMap<u16, u16>,
    pat_version: Option<u8>,
    /// program_number -> version
    pmt_versions: HashMap<u16, u8>,
    streams: HashMap<u16, ElementaryStreamInfo>,
}

impl PsiTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether packets on this PID carry PSI rather than PES data
    pub fn is_psi_pid(&self, pid: u16) -> bool {
        pid == PID_PAT || self.pmt_pids.contains_key(&pid)
    }

    /// Feeds one packet on a PSI PID.
    ///
    /// Returns `Ok(true)` when a new table version changed the stream map.
    pub fn process_packet(&mut self, packet: &TsPacket) -> Result<bool> {
        if !packet.payload_unit_start_indicator {
            return Ok(false);
        }
        let Some(psi_payload) = packet.psi_payload() else {
            return Ok(false);
        };
        match psi_payload.first() {
            Some(0x00) => self.process_pat(PatRef::parse(psi_payload)?),
            Some(0x02) if self.pmt_pids.contains_key(&packet.pid) => {
                self.process_pmt(packet.pid, PmtRef::parse(psi_payload)?)
            }
            _ => Ok(false),
        }
    }

    fn process_pat(&mut self, pat: PatRef) -> Result<bool> {
        if self.pat_version == Some(pat.version_number) {
            return Ok(false);
        }
        self.pat_version = Some(pat.version_number);

        // A new PAT version invalidates everything learned from PMTs
        self.pmt_pids.clear();
        self.pmt_versions.clear();
        self.streams.clear();

        for (program_number, pmt_pid) in pat.programs() {
            // Program 0 points at the network PID, not a PMT
            if program_number != 0 {
                self.pmt_pids.insert(pmt_pid, program_number);
            }
        }
        debug!(
            version = pat.version_number,
            programs = self.pmt_pids.len(),
            "PAT updated"
        );
        Ok(true)
    }

    fn process_pmt(&mut self, pid: u16, pmt: PmtRef) -> Result<bool> {
        let program_number = self.pmt_pids.get(&pid).copied().unwrap_or(pmt.program_number);
        let is_new = self
            .pmt_versions
            .get(&program_number)
            .is_none_or(|&v| v != pmt.version_number);
        if !is_new {
            return Ok(false);
        }
        self.pmt_versions.insert(program_number, pmt.version_number);
        self.streams
            .retain(|_, info| info.program_number != program_number);

        for stream in pmt.streams() {
            let stream = stream?;
            debug!(
                program = program_number,
                pid = stream.elementary_pid,
                stream_type = ?stream.stream_type,
                "PMT stream"
            );
            self.streams.insert(
                stream.elementary_pid,
                ElementaryStreamInfo {
                    program_number,
                    stream_type: stream.stream_type,
                    descriptor_tags: descriptor_tags(&stream.es_info),
                },
            );
        }
        Ok(true)
    }

    /// Declared info for an elementary PID, if a PMT listed it
    pub fn stream_info(&self, pid: u16) -> Option<&ElementaryStreamInfo> {
        self.streams.get(&pid)
    }

    /// Whether a PMT of the current PAT has been decoded
    pub fn has_program_map(&self) -> bool {
        !self.pmt_versions.is_empty()
    }

    /// Number of elementary PIDs currently declared
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Reset tracker state
    pub fn reset(&mut self) {
        self.pmt_pids.clear();
        self.pat_version = None;
        self.pmt_versions.clear();
        self.streams.clear();
    }
}
