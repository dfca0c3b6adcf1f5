use crate::transport::defs::{
    FrameKind, HEADER_SIZE, MAX_DATA_SIZE, SACK_BLOCK_SIZE, WINDOW_SIZE,
};
use anyhow::Result;

// 0                   1                   2                   3
// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |     Type      |     Flags     |           Checksum            |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                        Sequence Number                        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                     Acknowledgment Number                     |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |          Window Size          |          Data Length          |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                           SACK Count                          |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                                                               :
// :                             Data                              :
// :                                                               |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                       SACK Left Edge 1                        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                       SACK Right Edge 1                       |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// :                              ...                              :
//
// All multi-byte integers are big-endian on the wire.

// Left edge is inclusive, right edge is exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SackBlock {
    pub left_edge: u32,
    pub right_edge: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub flags: u8,
    pub checksum: u16,
    pub seq_num: u32,
    pub ack_num: u32,
    pub window_size: u16,
    pub data_length: u16,
    pub sack_count: u32,
    pub payload: Vec<u8>,
    pub sack_blocks: Vec<SackBlock>,
}

impl Frame {
    pub fn new() -> Self {
        Self {
            kind: FrameKind::Unknown,
            flags: 0,
            checksum: 0,
            seq_num: 0,
            ack_num: 0,
            window_size: 0,
            data_length: 0,
            sack_count: 0,
            payload: Vec::new(),
            sack_blocks: Vec::new(),
        }
    }

    pub fn new_syn(seq_num: u32) -> Self {
        let mut frame = Frame::new();
        frame.kind = FrameKind::Syn;
        frame.seq_num = seq_num;
        frame.checksum = frame.calc_checksum();
        frame
    }

    pub fn new_syn_ack(ack_num: u32) -> Self {
        let mut frame = Frame::new();
        frame.kind = FrameKind::SynAck;
        frame.ack_num = ack_num;
        frame.checksum = frame.calc_checksum();
        frame
    }

    pub fn new_data(seq_num: u32, payload: Vec<u8>) -> Self {
        let mut frame = Frame::new();
        frame.kind = FrameKind::Data;
        frame.seq_num = seq_num;
        frame.data_length = payload.len() as u16;
        frame.payload = payload;
        frame.checksum = frame.calc_checksum();
        frame
    }

    pub fn new_ack(seq_num: u32, ack_num: u32, sack_blocks: Vec<SackBlock>) -> Self {
        let mut frame = Frame::new();
        frame.kind = FrameKind::Ack;
        frame.seq_num = seq_num;
        frame.ack_num = ack_num;
        frame.window_size = WINDOW_SIZE as u16;
        frame.sack_count = sack_blocks.len() as u32;
        frame.sack_blocks = sack_blocks;
        frame.checksum = frame.calc_checksum();
        frame
    }

    pub fn new_fin(seq_num: u32) -> Self {
        let mut frame = Frame::new();
        frame.kind = FrameKind::Fin;
        frame.seq_num = seq_num;
        frame.checksum = frame.calc_checksum();
        frame
    }

    pub fn new_fin_ack(ack_num: u32) -> Self {
        let mut frame = Frame::new();
        frame.kind = FrameKind::FinAck;
        frame.ack_num = ack_num;
        frame.checksum = frame.calc_checksum();
        frame
    }

    pub fn new_file_name(seq_num: u32, name: &[u8]) -> Self {
        let mut frame = Frame::new();
        frame.kind = FrameKind::FileName;
        frame.seq_num = seq_num;
        let length = name.len().min(MAX_DATA_SIZE);
        frame.payload = name[..length].to_vec();
        frame.data_length = length as u16;
        frame.checksum = frame.calc_checksum();
        frame
    }

    pub fn new_file_name_ack(ack_num: u32) -> Self {
        let mut frame = Frame::new();
        frame.kind = FrameKind::FileNameAck;
        frame.ack_num = ack_num;
        frame.checksum = frame.calc_checksum();
        frame
    }

    pub fn read(&mut self, buf: &[u8]) -> Result<()> {
        anyhow::ensure!(
            buf.len() >= HEADER_SIZE,
            "Frame is {} bytes, must be at least the header length ({}).",
            buf.len(),
            HEADER_SIZE
        );
        self.kind = FrameKind::from(buf[0]);
        anyhow::ensure!(
            self.kind != FrameKind::Unknown,
            "Unknown frame type byte 0x{:02x}.",
            buf[0]
        );
        self.flags = buf[1];
        self.checksum = u16::from_be_bytes(buf[2..4].try_into()?);
        self.seq_num = u32::from_be_bytes(buf[4..8].try_into()?);
        self.ack_num = u32::from_be_bytes(buf[8..12].try_into()?);
        self.window_size = u16::from_be_bytes(buf[12..14].try_into()?);
        self.data_length = u16::from_be_bytes(buf[14..16].try_into()?);
        self.sack_count = u32::from_be_bytes(buf[16..20].try_into()?);
        anyhow::ensure!(
            self.data_length as usize <= MAX_DATA_SIZE,
            "Frame data length is {}, must be smaller than {}+1.",
            self.data_length,
            MAX_DATA_SIZE
        );
        let expected =
            HEADER_SIZE + self.data_length as usize + self.sack_count as usize * SACK_BLOCK_SIZE;
        anyhow::ensure!(
            expected <= buf.len(),
            "Frame length fields indicate {} bytes but only {} arrived.",
            expected,
            buf.len()
        );
        let mut offset = HEADER_SIZE;
        self.payload = buf[offset..offset + self.data_length as usize].to_vec();
        offset += self.data_length as usize;
        self.sack_blocks = Vec::with_capacity(self.sack_count as usize);
        for _ in 0..self.sack_count {
            let left_edge = u32::from_be_bytes(buf[offset..offset + 4].try_into()?);
            let right_edge = u32::from_be_bytes(buf[offset + 4..offset + 8].try_into()?);
            self.sack_blocks.push(SackBlock {
                left_edge,
                right_edge,
            });
            offset += SACK_BLOCK_SIZE;
        }
        Ok(())
    }

    pub fn create_header(&self, checksum: u16) -> Vec<u8> {
        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.push(u8::from(self.kind));
        header.push(self.flags);
        header.extend_from_slice(&checksum.to_be_bytes());
        header.extend_from_slice(&self.seq_num.to_be_bytes());
        header.extend_from_slice(&self.ack_num.to_be_bytes());
        header.extend_from_slice(&self.window_size.to_be_bytes());
        header.extend_from_slice(&self.data_length.to_be_bytes());
        header.extend_from_slice(&self.sack_count.to_be_bytes());
        header
    }

    pub fn create_frame(&self) -> Vec<u8> {
        let mut frame = self.create_header(self.checksum);
        frame.extend_from_slice(&self.payload);
        for sack in &self.sack_blocks {
            frame.extend_from_slice(&sack.left_edge.to_be_bytes());
            frame.extend_from_slice(&sack.right_edge.to_be_bytes());
        }
        frame
    }

    pub fn calc_checksum(&self) -> u16 {
        let mut sum = add_words(0, &self.create_header(0));
        sum = add_words(sum, &self.payload);
        for sack in &self.sack_blocks {
            sum = add_words(sum, &sack.left_edge.to_be_bytes());
            sum = add_words(sum, &sack.right_edge.to_be_bytes());
        }
        while (sum >> 16) > 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !(sum as u16)
    }

    pub fn verify_checksum(&self) -> bool {
        self.calc_checksum() == self.checksum
    }
}

// One's-complement accumulation of big-endian 16-bit words; an odd trailing
// byte is treated as the high half of a zero-padded word.
fn add_words(mut sum: u32, bytes: &[u8]) -> u32 {
    let mut i = 0;
    while i + 1 < bytes.len() {
        sum += u32::from(u16::from_be_bytes([bytes[i], bytes[i + 1]]));
        i += 2;
    }
    if i < bytes.len() {
        sum += u32::from(bytes[i]) << 8;
    }
    sum
}

#[cfg(test)]
mod frame_tests {
    use super::*;
    use hex::decode;
    use rstest::rstest;

    #[rstest]
    #[case(Frame::new_syn(0))]
    #[case(Frame::new_syn_ack(1))]
    #[case(Frame::new_data(7, vec![1, 2, 3, 4, 5]))]
    #[case(Frame::new_data(8, vec![0xff; MAX_DATA_SIZE]))]
    #[case(Frame::new_data(9, vec![0xab; 3]))] // odd-length payload
    #[case(Frame::new_ack(0, 12, vec![
        SackBlock { left_edge: 14, right_edge: 16 },
        SackBlock { left_edge: 20, right_edge: 21 },
    ]))]
    #[case(Frame::new_fin(42))]
    #[case(Frame::new_fin_ack(43))]
    #[case(Frame::new_file_name(0, b"archive.tar.gz"))]
    #[case(Frame::new_file_name_ack(1))]
    fn test_frame_roundtrip(#[case] frame: Frame) {
        let bytes = frame.create_frame();
        let mut parsed = Frame::new();
        parsed.read(&bytes).expect("Failed to read frame");
        assert_eq!(parsed, frame);
        assert!(parsed.verify_checksum());
    }

    #[rstest]
    // SYN with seq 0: only the type/flags word contributes to the sum.
    #[case(Frame::new_syn(0), "0100feff00000000000000000000000000000000")]
    // DATA seq=5 payload "hi".
    #[case(
        Frame::new_data(5, b"hi".to_vec()),
        "0300948f000000050000000000000002000000006869"
    )]
    // ACK ack=7 window=16 with one SACK block [9, 11).
    #[case(
        Frame::new_ack(0, 7, vec![SackBlock { left_edge: 9, right_edge: 11 }]),
        "0400fbd300000000000000070010000000000001000000090000000b"
    )]
    fn test_frame_encoding(#[case] frame: Frame, #[case] expected_hex: &str) {
        let expected = decode(expected_hex).expect("Failed to decode hex string");
        assert_eq!(frame.create_frame(), expected);
        let mut parsed = Frame::new();
        parsed.read(&expected).expect("Failed to read frame");
        assert!(parsed.verify_checksum());
    }

    #[rstest]
    // shorter than the fixed header
    #[case(vec![0x01; 19])]
    // unknown type byte
    #[case(Frame::new_syn(0).create_frame().iter().enumerate().map(|(i, &b)| if i == 0 { 0x7f } else { b }).collect())]
    // data_length larger than the remaining bytes
    #[case({
        let mut frame = Frame::new_data(1, vec![1, 2, 3, 4]);
        frame.data_length = 100;
        frame.create_header(frame.checksum).into_iter().chain([1, 2, 3, 4]).collect()
    })]
    // sack_count without the trailing blocks
    #[case({
        let mut frame = Frame::new_ack(0, 1, Vec::new());
        frame.sack_count = 2;
        frame.create_header(frame.checksum)
    })]
    fn test_frame_read_error(#[case] bytes: Vec<u8>) {
        let mut frame = Frame::new();
        assert!(frame.read(&bytes).is_err());
    }

    #[test]
    fn test_frame_read_rejects_oversized_data_length() {
        let mut frame = Frame::new_data(1, vec![0; 4]);
        frame.data_length = (MAX_DATA_SIZE + 1) as u16;
        let mut bytes = frame.create_header(frame.checksum);
        bytes.extend(vec![0u8; MAX_DATA_SIZE + 1]);
        let mut parsed = Frame::new();
        assert!(parsed.read(&bytes).is_err());
    }

    #[test]
    fn test_frame_read_ignores_trailing_bytes() {
        let mut bytes = Frame::new_data(3, b"abc".to_vec()).create_frame();
        bytes.extend_from_slice(&[0xde, 0xad]);
        let mut parsed = Frame::new();
        parsed.read(&bytes).expect("Failed to read frame");
        assert_eq!(parsed.payload, b"abc");
        assert!(parsed.verify_checksum());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let frame = Frame::new_data(2, b"payload".to_vec());
        let mut bytes = frame.create_frame();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let mut parsed = Frame::new();
        parsed.read(&bytes).expect("Failed to read frame");
        assert!(!parsed.verify_checksum());
    }

    #[test]
    fn test_file_name_payload_is_truncated() {
        let name = vec![b'a'; MAX_DATA_SIZE + 200];
        let frame = Frame::new_file_name(0, &name);
        assert_eq!(frame.payload.len(), MAX_DATA_SIZE);
        assert_eq!(frame.data_length as usize, MAX_DATA_SIZE);
        assert!(frame.verify_checksum());
    }
}
