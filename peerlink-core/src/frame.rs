//! Block framing: 20-byte header (sign, length, flag, checksum) + ciphertext.
//!
//! Header integers are big-endian. The checksum covers the plaintext; the
//! length field is the plaintext length (the cipher preserves length).

use crate::checksum::ChecksumTable;
use crate::cipher::CipherKey;

/// Magic marker opening every block header.
pub const SIGN: [u8; 8] = [0xf9, 0x9f, 0xec, 0xff, 0xff, 0x0a, 0x9f, 0xf9];

/// Header size: sign (8) + length (4) + flag (4) + checksum (4).
pub const HEADER_LEN: usize = 20;

/// Size of the unframed heartbeat probe.
pub const PROBE_LEN: usize = 16;

/// Liveness probe, sent raw. Receivers recognize it by size, never by content.
pub const HEARTBEAT_PROBE: [u8; PROBE_LEN] = *b"85j#$^dfgl@s23\0\0";

/// Parsed block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Plaintext length in bytes.
    pub length: u32,
    /// Reserved, always 0 on send; ignored on receive.
    pub flag: u32,
    /// Checksum of the plaintext.
    pub checksum: u32,
}

impl FrameHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..8].copy_from_slice(&SIGN);
        out[8..12].copy_from_slice(&self.length.to_be_bytes());
        out[12..16].copy_from_slice(&self.flag.to_be_bytes());
        out[16..20].copy_from_slice(&self.checksum.to_be_bytes());
        out
    }

    /// Parse a header from the front of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::PartialHeader {
                needed: HEADER_LEN,
                got: bytes.len(),
            });
        }
        if !has_sign(bytes) {
            return Err(FrameError::NotAFrame);
        }
        let field = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        Ok(FrameHeader {
            length: field(8),
            flag: field(12),
            checksum: field(16),
        })
    }

    /// Declared body length, checked against the receive capacity before any body read.
    pub fn body_len(&self, max_payload: usize) -> Result<usize, FrameError> {
        let len = self.length as usize;
        if len > max_payload {
            return Err(FrameError::Oversized {
                length: self.length,
                max: max_payload,
            });
        }
        Ok(len)
    }
}

/// True if `bytes` opens with the block sign.
pub fn has_sign(bytes: &[u8]) -> bool {
    bytes.len() >= SIGN.len() && bytes[..SIGN.len()] == SIGN
}

/// What a self-contained inbound unit (one datagram) turned out to be.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// Header plus whatever followed it.
    Block {
        header: FrameHeader,
        body: &'a [u8],
    },
    /// Probe-sized unit without the sign.
    Heartbeat,
    /// Anything else; dropped by the receiver.
    Unrecognized,
}

/// Classify a complete inbound unit.
pub fn classify(unit: &[u8]) -> Inbound<'_> {
    match FrameHeader::parse(unit) {
        Ok(header) => Inbound::Block {
            header,
            body: &unit[HEADER_LEN..],
        },
        Err(_) if unit.len() == PROBE_LEN && !has_sign(unit) => Inbound::Heartbeat,
        Err(_) => Inbound::Unrecognized,
    }
}

/// Error framing or unframing a block.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("not a block: sign mismatch")]
    NotAFrame,
    #[error("partial header: need {needed} bytes, got {got}")]
    PartialHeader { needed: usize, got: usize },
    #[error("oversized block: declares {length} bytes, limit is {max}")]
    Oversized { length: u32, max: usize },
    #[error("block body is {actual} bytes, header declares {declared}")]
    LengthMismatch { declared: u32, actual: usize },
    #[error("checksum mismatch: header {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("payload of {0} bytes does not fit a block")]
    TooLarge(usize),
}

/// Encodes and decodes blocks. Holds the immutable checksum table and key;
/// share one per link.
#[derive(Default)]
pub struct FrameCodec {
    checksum: ChecksumTable,
    key: CipherKey,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checksum_table(&self) -> &ChecksumTable {
        &self.checksum
    }

    /// Header for `payload`: plaintext length and plaintext checksum.
    pub fn header_for(&self, payload: &[u8]) -> Result<FrameHeader, FrameError> {
        let length = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge(payload.len()))?;
        Ok(FrameHeader {
            length,
            flag: 0,
            checksum: self.checksum.checksum(payload),
        })
    }

    /// Encode `payload` into header + ciphertext.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        let header = self.header_for(payload)?;
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(payload);
        self.key.apply_in_place(&mut out[HEADER_LEN..]);
        Ok(out)
    }

    /// Decrypt `body` in place and check it against `header`.
    /// On error the buffer holds unverified plaintext and must be dropped.
    pub fn decrypt_and_verify_in_place(&self, header: &FrameHeader, body: &mut [u8]) -> Result<(), FrameError> {
        if body.len() != header.length as usize {
            return Err(FrameError::LengthMismatch {
                declared: header.length,
                actual: body.len(),
            });
        }
        self.key.apply_in_place(body);
        let actual = self.checksum.checksum(body);
        if actual != header.checksum {
            return Err(FrameError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }
        Ok(())
    }

    /// Decrypt a copy of `ciphertext` and check it against `header`.
    pub fn decrypt_and_verify(&self, header: &FrameHeader, ciphertext: &[u8]) -> Result<Vec<u8>, FrameError> {
        let mut plain = ciphertext.to_vec();
        self.decrypt_and_verify_in_place(header, &mut plain)?;
        Ok(plain)
    }

    /// Decode one complete block (header + ciphertext, nothing trailing).
    pub fn decode(&self, block: &[u8], max_payload: usize) -> Result<Vec<u8>, FrameError> {
        let header = FrameHeader::parse(block)?;
        header.body_len(max_payload)?;
        self.decrypt_and_verify(&header, &block[HEADER_LEN..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_MAX_PAYLOAD;
    use proptest::prelude::*;
    use rand::Rng;

    fn hello_payload() -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        buf[..12].copy_from_slice(b"hello world!");
        buf
    }

    #[test]
    fn header_layout() {
        let header = FrameHeader {
            length: 0x0102_0304,
            flag: 0,
            checksum: 0xa1b2_c3d4,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes[..8], SIGN);
        assert_eq!(bytes[8..12], [1, 2, 3, 4]);
        assert_eq!(bytes[12..16], [0, 0, 0, 0]);
        assert_eq!(bytes[16..20], [0xa1, 0xb2, 0xc3, 0xd4]);
        assert_eq!(FrameHeader::parse(&bytes), Ok(header));
    }

    #[test]
    fn body_is_encrypted_under_the_shared_key() {
        let block = FrameCodec::new().encode(b"shared key").unwrap();
        assert_eq!(&block[HEADER_LEN..], CipherKey::default().apply(b"shared key").as_slice());
        assert_ne!(&block[HEADER_LEN..], b"shared key");
    }

    #[test]
    fn encode_decode_hello() {
        let codec = FrameCodec::new();
        let payload = hello_payload();
        let block = codec.encode(&payload).unwrap();
        assert_eq!(block.len(), HEADER_LEN + 1024);
        // Ciphertext on the wire, not plaintext.
        assert_ne!(&block[HEADER_LEN..HEADER_LEN + 12], b"hello world!");

        let header = FrameHeader::parse(&block).unwrap();
        assert_eq!(header.length, 1024);
        assert_eq!(header.flag, 0);
        assert_eq!(header.checksum, codec.checksum_table().checksum(&payload));

        let plain = codec.decode(&block, DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(plain.len(), 1024);
        assert_eq!(&plain[..12], b"hello world!");
    }

    #[test]
    fn empty_payload() {
        let codec = FrameCodec::new();
        let block = codec.encode(&[]).unwrap();
        assert_eq!(block.len(), HEADER_LEN);
        assert_eq!(codec.decode(&block, DEFAULT_MAX_PAYLOAD).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn sign_mismatch_is_not_a_frame() {
        let codec = FrameCodec::new();
        let mut block = codec.encode(b"payload").unwrap();
        block[3] ^= 0x01;
        assert_eq!(FrameHeader::parse(&block), Err(FrameError::NotAFrame));
        assert_eq!(codec.decode(&block, DEFAULT_MAX_PAYLOAD), Err(FrameError::NotAFrame));
    }

    #[test]
    fn partial_header() {
        let codec = FrameCodec::new();
        let block = codec.encode(b"payload").unwrap();
        assert_eq!(
            FrameHeader::parse(&block[..HEADER_LEN - 1]),
            Err(FrameError::PartialHeader {
                needed: HEADER_LEN,
                got: HEADER_LEN - 1
            })
        );
    }

    #[test]
    fn oversized_declared_length() {
        let header = FrameHeader {
            length: (DEFAULT_MAX_PAYLOAD + 1) as u32,
            flag: 0,
            checksum: 0,
        };
        assert_eq!(
            header.body_len(DEFAULT_MAX_PAYLOAD),
            Err(FrameError::Oversized {
                length: (DEFAULT_MAX_PAYLOAD + 1) as u32,
                max: DEFAULT_MAX_PAYLOAD
            })
        );
        assert_eq!(header.body_len(DEFAULT_MAX_PAYLOAD + 1), Ok(DEFAULT_MAX_PAYLOAD + 1));
    }

    #[test]
    fn truncated_body() {
        let codec = FrameCodec::new();
        let block = codec.encode(b"0123456789").unwrap();
        assert_eq!(
            codec.decode(&block[..block.len() - 1], DEFAULT_MAX_PAYLOAD),
            Err(FrameError::LengthMismatch {
                declared: 10,
                actual: 9
            })
        );
    }

    #[test]
    fn classify_units() {
        let codec = FrameCodec::new();
        let block = codec.encode(b"abc").unwrap();
        match classify(&block) {
            Inbound::Block { header, body } => {
                assert_eq!(header.length, 3);
                assert_eq!(body.len(), 3);
            }
            other => panic!("expected block, got {other:?}"),
        }
        assert_eq!(classify(&HEARTBEAT_PROBE), Inbound::Heartbeat);
        // Any sixteen bytes without the sign count as a heartbeat.
        assert_eq!(classify(&[0x55; PROBE_LEN]), Inbound::Heartbeat);
        assert_eq!(classify(&[0x55; 7]), Inbound::Unrecognized);
        assert_eq!(classify(&[0x55; HEADER_LEN]), Inbound::Unrecognized);
    }

    #[test]
    fn random_single_byte_flips_detected() {
        let codec = FrameCodec::new();
        let mut rng = rand::thread_rng();
        let payload: Vec<u8> = (0..512).map(|_| rng.gen()).collect();
        let block = codec.encode(&payload).unwrap();
        for _ in 0..200 {
            let mut tampered = block.clone();
            let at = rng.gen_range(HEADER_LEN..tampered.len());
            tampered[at] ^= rng.gen_range(1..=255u8);
            assert!(matches!(
                codec.decode(&tampered, DEFAULT_MAX_PAYLOAD),
                Err(FrameError::ChecksumMismatch { .. })
            ));
        }
    }

    proptest! {
        #[test]
        fn encode_then_verify(payload in proptest::collection::vec(any::<u8>(), 0..8192)) {
            let codec = FrameCodec::new();
            let block = codec.encode(&payload).unwrap();
            prop_assert_eq!(codec.decode(&block, DEFAULT_MAX_PAYLOAD).unwrap(), payload);
        }

        #[test]
        fn ciphertext_flip_is_checksum_mismatch(
            payload in proptest::collection::vec(any::<u8>(), 1..2048),
            pos in any::<prop::sample::Index>(),
            mask in 1..=255u8,
        ) {
            let codec = FrameCodec::new();
            let mut block = codec.encode(&payload).unwrap();
            let at = HEADER_LEN + pos.index(payload.len());
            block[at] ^= mask;
            let is_mismatch = matches!(
                codec.decode(&block, DEFAULT_MAX_PAYLOAD),
                Err(FrameError::ChecksumMismatch { .. })
            );
            prop_assert!(is_mismatch);
        }

        #[test]
        fn checksum_field_flip_is_mismatch(
            payload in proptest::collection::vec(any::<u8>(), 0..512),
            pos in 16..HEADER_LEN,
            mask in 1..=255u8,
        ) {
            let codec = FrameCodec::new();
            let mut block = codec.encode(&payload).unwrap();
            block[pos] ^= mask;
            let is_mismatch = matches!(
                codec.decode(&block, DEFAULT_MAX_PAYLOAD),
                Err(FrameError::ChecksumMismatch { .. })
            );
            prop_assert!(is_mismatch);
        }
    }
}
