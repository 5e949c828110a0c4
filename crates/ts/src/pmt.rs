/// Stream types declared for elementary PIDs in a PMT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Mpeg1Video,
    Mpeg2Video,
    Mpeg1Audio,
    Mpeg2Audio,
    /// Private PES packets, the carrier of DVB subtitles, teletext and AC-3
    PrivatePes,
    AdtsAac,
    Mpeg4Visual,
    LatmAac,
    H264,
    H265,
    H266,
    Ac3,
    Dts,
    TrueHd,
    EAc3,
    DtsHd,
    /// PGS subtitles on Blu-ray transport streams
    HdmvPgs,
    /// Text subtitles on Blu-ray transport streams
    HdmvText,
    Unknown(u8),
}

impl From<u8> for StreamType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => StreamType::Mpeg1Video,
            0x02 => StreamType::Mpeg2Video,
            0x03 => StreamType::Mpeg1Audio,
            0x04 => StreamType::Mpeg2Audio,
            0x06 => StreamType::PrivatePes,
            0x0F => StreamType::AdtsAac,
            0x10 => StreamType::Mpeg4Visual,
            0x11 => StreamType::LatmAac,
            0x1B => StreamType::H264,
            0x24 => StreamType::H265,
            0x33 => StreamType::H266,
            0x81 => StreamType::Ac3,
            0x82 => StreamType::Dts,
            0x83 => StreamType::TrueHd,
            0x84 | 0x87 => StreamType::EAc3,
            0x85 | 0x86 => StreamType::DtsHd,
            0x90 => StreamType::HdmvPgs,
            0x92 => StreamType::HdmvText,
            _ => StreamType::Unknown(value),
        }
    }
}

/// ES descriptor tags that disambiguate private PES streams
pub mod descriptor {
    pub const TELETEXT: u8 = 0x56;
    pub const SUBTITLING: u8 = 0x59;
    pub const AC3: u8 = 0x6A;
    pub const ENHANCED_AC3: u8 = 0x7A;
    pub const DTS: u8 = 0x7B;
    pub const AAC: u8 = 0x7C;
    pub const VBI_TELETEXT: u8 = 0x46;
}

/// Walks a descriptor loop and returns the tags it contains.
///
/// A descriptor whose length runs past the loop ends the walk.
pub fn descriptor_tags(mut data: &[u8]) -> Vec<u8> {
    let mut tags = Vec::new();
    while data.len() >= 2 {
        let tag = data[0];
        let length = data[1] as usize;
        if data.len() < 2 + length {
            break;
        }
        tags.push(tag);
        data = &data[2 + length..];
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_type_conversion() {
        assert_eq!(StreamType::from(0x1B), StreamType::H264);
        assert_eq!(StreamType::from(0x06), StreamType::PrivatePes);
        assert_eq!(StreamType::from(0x87), StreamType::EAc3);
        assert_eq!(StreamType::from(0xFF), StreamType::Unknown(0xFF));
    }

    #[test]
    fn test_descriptor_tags() {
        let loop_bytes = [0x59, 0x02, 0xAA, 0xBB, 0x6A, 0x00, 0x56, 0x09, 0x00];
        // the teletext descriptor claims 9 bytes but only one follows
        assert_eq!(descriptor_tags(&loop_bytes), vec![0x59, 0x6A]);
    }
}
