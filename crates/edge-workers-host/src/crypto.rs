//! The `crypto` subset available to guests: digests, random bytes, UUIDs.
//!
//! Everything else under `crypto.subtle` is present in the guest API but
//! fails with [`HostError::NotImplemented`].

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use edge_workers_common::HostError;

/// Largest buffer `getRandomValues` will fill.
pub const MAX_RANDOM_BYTES: usize = 65_536;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
    Md5,
}

impl DigestAlgorithm {
    /// Parse a WebCrypto algorithm name. Case-insensitive, dash optional.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::UnsupportedAlgorithm`] for anything else.
    pub fn parse(name: &str) -> Result<Self, HostError> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '-')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match normalized.as_str() {
            "SHA1" => Ok(Self::Sha1),
            "SHA256" => Ok(Self::Sha256),
            "SHA384" => Ok(Self::Sha384),
            "SHA512" => Ok(Self::Sha512),
            "MD5" => Ok(Self::Md5),
            _ => Err(HostError::UnsupportedAlgorithm {
                algorithm: name.to_string(),
            }),
        }
    }

    /// Hash `data`.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
            Self::Md5 => Md5::digest(data).to_vec(),
        }
    }
}

/// `crypto.subtle.digest`.
pub fn digest(algorithm: &str, data: &[u8]) -> Result<Vec<u8>, HostError> {
    DigestAlgorithm::parse(algorithm).map(|algorithm| algorithm.digest(data))
}

/// Cryptographically random bytes for `crypto.getRandomValues`.
///
/// # Errors
///
/// - [`HostError::InvalidArgument`] above [`MAX_RANDOM_BYTES`]
/// - [`HostError::InvalidArgument`] if the OS source fails
pub fn random_bytes(len: usize) -> Result<Vec<u8>, HostError> {
    if len > MAX_RANDOM_BYTES {
        return Err(HostError::invalid_argument(format!(
            "QuotaExceededError: {len} bytes requested, at most {MAX_RANDOM_BYTES} allowed"
        )));
    }
    let mut buf = vec![0u8; len];
    getrandom::getrandom(&mut buf)
        .map_err(|e| HostError::invalid_argument(format!("random source unavailable: {e}")))?;
    Ok(buf)
}

/// `crypto.randomUUID`: a version 4 UUID in hyphenated lower case.
pub fn random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Error for a `crypto.subtle` operation that exists but is not supported.
pub fn unsupported(operation: &str) -> HostError {
    HostError::not_implemented(operation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        let out = digest("SHA-256", b"abc").unwrap();
        assert_eq!(
            hex::encode(out),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(DigestAlgorithm::parse("sha-1").unwrap(), DigestAlgorithm::Sha1);
        assert_eq!(DigestAlgorithm::parse("SHA512").unwrap(), DigestAlgorithm::Sha512);
        assert_eq!(DigestAlgorithm::parse("md5").unwrap(), DigestAlgorithm::Md5);
        assert!(matches!(
            DigestAlgorithm::parse("SHA-3"),
            Err(HostError::UnsupportedAlgorithm { .. })
        ));
    }

    #[test]
    fn test_digest_lengths() {
        assert_eq!(digest("SHA-1", b"").unwrap().len(), 20);
        assert_eq!(digest("SHA-384", b"").unwrap().len(), 48);
        assert_eq!(
            hex::encode(digest("MD5", b"").unwrap()),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[test]
    fn test_random_bytes_limits() {
        assert_eq!(random_bytes(0).unwrap().len(), 0);
        assert_eq!(random_bytes(32).unwrap().len(), 32);
        assert_eq!(random_bytes(MAX_RANDOM_BYTES).unwrap().len(), MAX_RANDOM_BYTES);
        assert!(random_bytes(MAX_RANDOM_BYTES + 1).is_err());
    }

    #[test]
    fn test_random_uuid_shape() {
        let id = random_uuid();
        assert_eq!(id.len(), 36);
        assert_eq!(id.chars().nth(14), Some('4'));
        assert_ne!(id, random_uuid());
    }

    #[test]
    fn test_unsupported_message() {
        let err = unsupported("crypto.subtle.encrypt");
        assert!(err.to_string().starts_with("NotImplemented"));
    }
}
