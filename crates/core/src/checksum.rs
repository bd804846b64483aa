//! Content-integrity digests for payloads entering and leaving the sync path.
//!
//! Guards against accidental corruption, not tampering: comparison is by
//! value, not constant time.

use crate::error::{SyncError, SyncResult};
use sha2::{Digest, Sha256, Sha512};

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    /// Hex length of a digest produced by this algorithm.
    pub const fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }
}

/// Algorithm used for every checksum the engine writes.
pub const CHECKSUM_ALGORITHM: ChecksumAlgorithm = ChecksumAlgorithm::Sha256;

/// Computes and verifies hex digests with a fixed algorithm.
///
/// Strings hash their UTF-8 bytes, so `"é"` and `b"\xc3\xa9"` agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumValidator {
    algorithm: ChecksumAlgorithm,
}

impl Default for ChecksumValidator {
    fn default() -> Self {
        Self::new(CHECKSUM_ALGORITHM)
    }
}

impl ChecksumValidator {
    pub const fn new(algorithm: ChecksumAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Lowercase hex digest of `data`.
    pub fn generate(&self, data: impl AsRef<[u8]>) -> String {
        let bytes = data.as_ref();
        match self.algorithm {
            ChecksumAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
            ChecksumAlgorithm::Sha512 => hex::encode(Sha512::digest(bytes)),
        }
    }

    /// Recomputes the digest and compares it to `expected` (case-insensitive hex).
    pub fn validate(&self, data: impl AsRef<[u8]>, expected: &str) -> bool {
        self.generate(data).eq_ignore_ascii_case(expected.trim())
    }

    /// Like [`validate`](Self::validate), but reports a mismatch as
    /// [`SyncError::ChecksumMismatch`] naming `subject`.
    pub fn verify(&self, subject: &str, data: impl AsRef<[u8]>, expected: &str) -> SyncResult<()> {
        let actual = self.generate(data);
        if actual.eq_ignore_ascii_case(expected.trim()) {
            Ok(())
        } else {
            Err(SyncError::ChecksumMismatch {
                subject: subject.to_string(),
                expected: expected.to_string(),
                actual,
            })
        }
    }
}

/// Digest of `data` with [`CHECKSUM_ALGORITHM`].
pub fn generate_checksum(data: impl AsRef<[u8]>) -> String {
    ChecksumValidator::default().generate(data)
}

/// `true` when `data` hashes to `expected` with [`CHECKSUM_ALGORITHM`].
pub fn validate_checksum(data: impl AsRef<[u8]>, expected: &str) -> bool {
    ChecksumValidator::default().validate(data, expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_sha256_vector() {
        assert_eq!(
            generate_checksum("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(generate_checksum("").len(), CHECKSUM_ALGORITHM.hex_len());
    }

    #[test]
    fn string_and_bytes_agree() {
        assert_eq!(generate_checksum("é"), generate_checksum(b"\xc3\xa9"));
    }

    #[test]
    fn single_byte_mutation_is_detected() {
        let data = br#"{"id":"env-1","balance":500}"#.to_vec();
        let digest = generate_checksum(&data);
        assert!(validate_checksum(&data, &digest));

        for i in 0..data.len() {
            let mut mutated = data.clone();
            mutated[i] ^= 0x01;
            assert!(!validate_checksum(&mutated, &digest), "byte {i} flip undetected");
        }
    }

    #[test]
    fn uppercase_expected_is_accepted() {
        let digest = generate_checksum("payload").to_uppercase();
        assert!(validate_checksum("payload", &digest));
    }

    #[test]
    fn verify_reports_mismatch() {
        let v = ChecksumValidator::default();
        let err = v.verify("chunk transactions_0", "a", &generate_checksum("b")).unwrap_err();
        match err {
            SyncError::ChecksumMismatch { subject, actual, .. } => {
                assert_eq!(subject, "chunk transactions_0");
                assert_eq!(actual, generate_checksum("a"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn sha512_length() {
        let v = ChecksumValidator::new(ChecksumAlgorithm::Sha512);
        assert_eq!(v.generate("x").len(), ChecksumAlgorithm::Sha512.hex_len());
    }
}
