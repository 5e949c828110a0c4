//! Fixture builders shared by the unit tests.

use std::collections::{HashMap, HashSet};

use tracing::Level;

const PMT_PID: u16 = 0x1000;

/// Initializes test logging once per process
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Encodes a 33-bit timestamp with a 4-bit prefix and marker bits
pub fn encode_timestamp(prefix: u8, value: u64) -> [u8; 5] {
    [
        (prefix << 4) | ((((value >> 30) & 0x07) as u8) << 1) | 1,
        (value >> 22) as u8,
        ((((value >> 15) & 0x7F) as u8) << 1) | 1,
        (value >> 7) as u8,
        (((value & 0x7F) as u8) << 1) | 1,
    ]
}

/// Builds an MPEG-2 PES packet. `dts` is only written together with `pts`.
/// An unbounded packet carries a zero length field.
pub fn pes_packet(
    stream_id: u8,
    pts: Option<u64>,
    dts: Option<u64>,
    payload: &[u8],
    bounded: bool,
) -> Vec<u8> {
    let mut timestamps = Vec::new();
    let flags = match (pts, dts) {
        (Some(pts), Some(dts)) => {
            timestamps.extend_from_slice(&encode_timestamp(0b0011, pts));
            timestamps.extend_from_slice(&encode_timestamp(0b0001, dts));
            0xC0
        }
        (Some(pts), None) => {
            timestamps.extend_from_slice(&encode_timestamp(0b0010, pts));
            0x80
        }
        (None, _) => 0x00,
    };

    let mut data = vec![0x00, 0x00, 0x01, stream_id, 0x00, 0x00, 0x80, flags];
    data.push(timestamps.len() as u8);
    data.extend_from_slice(&timestamps);
    data.extend_from_slice(payload);
    if bounded {
        let length = (data.len() - 6) as u16;
        data[4..6].copy_from_slice(&length.to_be_bytes());
    }
    data
}

/// Elementary stream bytes that never form a start code
pub fn es_payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| 0x80 + ((i + seed as usize) % 0x40) as u8)
        .collect()
}

/// Minimal transport stream muxer: PAT and PMT first, then 188-byte packets
/// with per-PID continuity counters and adaptation field stuffing.
#[derive(Debug, Default)]
pub struct TsBuilder {
    out: Vec<u8>,
    streams: Vec<(u16, u8, Vec<u8>)>,
    counters: HashMap<u16, u8>,
    discontinuity: HashSet<u16>,
    tables_written: bool,
}

impl TsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a PMT entry. Must be called before the first packet.
    pub fn declare(&mut self, pid: u16, stream_type: u8, descriptors: &[u8]) -> &mut Self {
        self.streams.push((pid, stream_type, descriptors.to_vec()));
        self
    }

    /// Flags the next packet of `pid` with the discontinuity indicator
    pub fn set_discontinuity(&mut self, pid: u16) -> &mut Self {
        self.discontinuity.insert(pid);
        self
    }

    /// Holds the PAT and PMT back until [`TsBuilder::add_tables`]
    pub fn defer_tables(&mut self) -> &mut Self {
        self.tables_written = true;
        self
    }

    /// Writes the PAT and PMT at the current position
    pub fn add_tables(&mut self) -> &mut Self {
        self.tables_written = false;
        self.write_tables();
        self
    }

    /// Bytes written so far, tables included
    pub fn position(&mut self) -> usize {
        self.write_tables();
        self.out.len()
    }

    pub fn add_pes(&mut self, pid: u16, pes: &[u8]) -> &mut Self {
        self.write_tables();
        let mut rest = pes;
        let mut first = true;
        while !rest.is_empty() {
            let flags = self.discontinuity.remove(&pid).then_some(0x80);
            let capacity = if flags.is_some() { 182 } else { 184 };
            let (chunk, tail) = rest.split_at(rest.len().min(capacity));
            self.write_packet(pid, first, chunk, flags);
            rest = tail;
            first = false;
        }
        self
    }

    pub fn add_null(&mut self) -> &mut Self {
        self.write_tables();
        let mut packet = vec![0x47, 0x1F, 0xFF, 0x10];
        packet.resize(188, 0xFF);
        self.out.extend_from_slice(&packet);
        self
    }

    pub fn build(mut self) -> Vec<u8> {
        self.write_tables();
        self.out
    }

    fn next_counter(&mut self, pid: u16) -> u8 {
        let counter = self.counters.entry(pid).or_insert(0);
        let current = *counter;
        *counter = (current + 1) & 0x0F;
        current
    }

    fn write_packet(&mut self, pid: u16, start: bool, chunk: &[u8], flags: Option<u8>) {
        let cc = self.next_counter(pid);
        let pusi = if start { 0x40 } else { 0x00 };
        let mut packet = vec![0x47, pusi | (pid >> 8) as u8, pid as u8];
        if chunk.len() == 184 && flags.is_none() {
            packet.push(0x10 | cc);
        } else {
            packet.push(0x30 | cc);
            let af_length = 183 - chunk.len();
            packet.push(af_length as u8);
            if af_length > 0 {
                packet.push(flags.unwrap_or(0x00));
                packet.resize(4 + 1 + af_length, 0xFF);
            }
        }
        packet.extend_from_slice(chunk);
        debug_assert_eq!(packet.len(), 188);
        self.out.extend_from_slice(&packet);
    }

    fn write_section(&mut self, pid: u16, section: &[u8]) {
        let cc = self.next_counter(pid);
        let mut packet = vec![0x47, 0x40 | (pid >> 8) as u8, pid as u8, 0x10 | cc, 0x00];
        packet.extend_from_slice(section);
        packet.resize(188, 0xFF);
        self.out.extend_from_slice(&packet);
    }

    fn write_tables(&mut self) {
        if self.tables_written {
            return;
        }
        self.tables_written = true;

        let pat = [
            0x00,
            0xB0,
            13,
            0x00,
            0x01,
            0xC1,
            0x00,
            0x00,
            0x00,
            0x01,
            0xE0 | (PMT_PID >> 8) as u8,
            PMT_PID as u8,
            0x00,
            0x00,
            0x00,
            0x00,
        ];
        self.write_section(0x0000, &pat);

        let pcr_pid = self.streams.first().map_or(0x1FFF, |(pid, _, _)| *pid);
        let mut entries = Vec::new();
        for (pid, stream_type, descriptors) in &self.streams {
            entries.push(*stream_type);
            entries.push(0xE0 | (pid >> 8) as u8);
            entries.push(*pid as u8);
            entries.push(0xF0 | (descriptors.len() >> 8) as u8);
            entries.push(descriptors.len() as u8);
            entries.extend_from_slice(descriptors);
        }
        let section_length = 9 + entries.len() + 4;
        let mut pmt = vec![
            0x02,
            0xB0 | (section_length >> 8) as u8,
            section_length as u8,
            0x00,
            0x01,
            0xC1,
            0x00,
            0x00,
            0xE0 | (pcr_pid >> 8) as u8,
            pcr_pid as u8,
            0xF0,
            0x00,
        ];
        pmt.extend_from_slice(&entries);
        pmt.extend_from_slice(&[0x00; 4]);
        self.write_section(PMT_PID, &pmt);
    }
}

/// Minimal program stream muxer starting with an MPEG-2 pack header
#[derive(Debug)]
pub struct PsBuilder {
    out: Vec<u8>,
}

impl Default for PsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PsBuilder {
    pub fn new() -> Self {
        let mut builder = Self { out: Vec::new() };
        builder.add_pack();
        builder
    }

    /// MPEG-2 pack header without stuffing, 14 bytes
    pub fn add_pack(&mut self) -> &mut Self {
        self.out.extend_from_slice(&[
            0x00, 0x00, 0x01, 0xBA, 0x44, 0x00, 0x04, 0x00, 0x04, 0x01, 0x01, 0x89, 0xC3, 0xF8,
        ]);
        self
    }

    /// MPEG-1 pack header, 12 bytes
    pub fn add_mpeg1_pack(&mut self) -> &mut Self {
        self.out.extend_from_slice(&[
            0x00, 0x00, 0x01, 0xBA, 0x21, 0x00, 0x01, 0x00, 0x01, 0x80, 0x00, 0x01,
        ]);
        self
    }

    /// System header with one stream entry, 18 bytes
    pub fn add_system_header(&mut self) -> &mut Self {
        self.out.extend_from_slice(&[
            0x00, 0x00, 0x01, 0xBB, 0x00, 0x0C, 0x80, 0xC4, 0xE1, 0x04, 0xE1, 0xFF, 0xE0, 0xE0,
            0xE8, 0xC0, 0xC0, 0x20,
        ]);
        self
    }

    pub fn add_pes(&mut self, pes: &[u8]) -> &mut Self {
        self.out.extend_from_slice(pes);
        self
    }

    pub fn add_raw(&mut self, data: &[u8]) -> &mut Self {
        self.out.extend_from_slice(data);
        self
    }

    pub fn add_end_code(&mut self) -> &mut Self {
        self.out.extend_from_slice(&[0x00, 0x00, 0x01, 0xB9]);
        self
    }

    /// Bytes written so far
    pub fn position(&self) -> usize {
        self.out.len()
    }

    pub fn build(self) -> Vec<u8> {
        self.out
    }
}
