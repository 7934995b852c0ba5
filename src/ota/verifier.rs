// Running integrity check over the image bytes as they are written

use sha2::{Digest as _, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestKind {
    /// Wrapping u32 sum of every byte, stored as a 4-byte little-endian trailer
    Additive,
    Sha256,
}

impl DigestKind {
    pub fn len(self) -> usize {
        match self {
            DigestKind::Additive => 4,
            DigestKind::Sha256 => 32,
        }
    }
}

#[derive(Clone)]
enum Accumulator {
    Additive(u32),
    Sha256(Sha256),
}

/// Digest state plus the number of bytes folded into it
#[derive(Clone)]
pub struct VerifierContext {
    accumulator: Accumulator,
    consumed: u64,
}

impl VerifierContext {
    pub fn new(kind: DigestKind) -> Self {
        let accumulator = match kind {
            DigestKind::Additive => Accumulator::Additive(0),
            DigestKind::Sha256 => Accumulator::Sha256(Sha256::new()),
        };
        Self { accumulator, consumed: 0 }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match &mut self.accumulator {
            Accumulator::Additive(sum) => {
                *sum = bytes.iter().fold(*sum, |acc, b| acc.wrapping_add(u32::from(*b)));
            }
            Accumulator::Sha256(hasher) => hasher.update(bytes),
        }
        self.consumed += bytes.len() as u64;
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Consumes the context; nothing can be added after this
    pub fn finalize(self) -> Digest {
        match self.accumulator {
            Accumulator::Additive(sum) => Digest::Additive(sum),
            Accumulator::Sha256(hasher) => Digest::Sha256(hasher.finalize().into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Digest {
    Additive(u32),
    Sha256([u8; 32]),
}

impl Digest {
    /// Bytes in the order they appear in a trailer or header field
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Digest::Additive(sum) => sum.to_le_bytes().to_vec(),
            Digest::Sha256(hash) => hash.to_vec(),
        }
    }

    pub fn matches(&self, expected: &[u8]) -> bool {
        match self {
            Digest::Additive(sum) => expected == sum.to_le_bytes().as_slice(),
            Digest::Sha256(hash) => expected == hash.as_slice(),
        }
    }

    pub fn to_hex(&self) -> String {
        match self {
            Digest::Additive(sum) => format!("0x{:08x}", sum),
            Digest::Sha256(hash) => hex::encode(hash),
        }
    }
}

/// Render expected bytes the way `Digest::to_hex` renders computed ones
pub fn expected_hex(kind: DigestKind, expected: &[u8]) -> String {
    match (kind, <[u8; 4]>::try_from(expected)) {
        (DigestKind::Additive, Ok(raw)) => format!("0x{:08x}", u32::from_le_bytes(raw)),
        _ => hex::encode(expected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_additive_is_chunking_independent() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i * 7) as u8).collect();
        let mut whole = VerifierContext::new(DigestKind::Additive);
        whole.update(&data);
        let mut split = VerifierContext::new(DigestKind::Additive);
        for chunk in data.chunks(333) {
            split.update(chunk);
        }
        assert_eq!(whole.consumed(), 5000);
        assert_eq!(whole.finalize(), split.finalize());
    }

    #[test]
    fn test_additive_wraps() {
        let mut ctx = VerifierContext::new(DigestKind::Additive);
        ctx.accumulator = Accumulator::Additive(u32::MAX);
        ctx.update(&[2]);
        assert_eq!(ctx.finalize(), Digest::Additive(1));
    }

    #[test]
    fn test_sha256_known_vector() {
        let mut ctx = VerifierContext::new(DigestKind::Sha256);
        ctx.update(b"abc");
        let digest = ctx.finalize();
        assert_eq!(
            digest.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(digest.matches(&digest.to_bytes()));
    }

    #[test]
    fn test_trailer_comparison() {
        let digest = Digest::Additive(0x0102_0304);
        assert!(digest.matches(&[4, 3, 2, 1]));
        assert!(!digest.matches(&[1, 2, 3, 4]));
        assert_eq!(expected_hex(DigestKind::Additive, &[4, 3, 2, 1]), "0x01020304");
    }
}
