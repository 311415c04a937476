use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};
use thiserror::Error;

pub const DIGEST_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Unknown digest algorithm '{0}'")]
    UnknownAlgorithm(String),
    #[error("Empty shared secret")]
    EmptySecret,
}

// Digest algorithms negotiable over the wire. The names travel in the
// protocol config packet, so parsing must accept exactly these strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlg {
    Sha256,
}

impl DigestAlg {
    pub fn digest_size(&self) -> usize {
        match self {
            DigestAlg::Sha256 => DIGEST_SIZE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlg::Sha256 => "sha256",
        }
    }

    // Digest over a list of byte slices, in order
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            DigestAlg::Sha256 => {
                let mut hasher = Sha256::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().to_vec()
            }
        }
    }
}

impl FromStr for DigestAlg {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" | "sha-256" => Ok(DigestAlg::Sha256),
            other => Err(CryptoError::UnknownAlgorithm(other.to_owned())),
        }
    }
}

impl fmt::Display for DigestAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Keyed digest used by the connection handshake (challenge-response).
// The secret never travels over the wire.
pub fn hmac_sha256(secret: &[u8], parts: &[&[u8]]) -> Result<[u8; DIGEST_SIZE], CryptoError> {
    if secret.is_empty() {
        return Err(CryptoError::EmptySecret);
    }
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|_| CryptoError::EmptySecret)?;
    for part in parts {
        mac.update(part);
    }
    let out = mac.finalize().into_bytes();
    let mut digest = [0u8; DIGEST_SIZE];
    digest.copy_from_slice(&out);
    Ok(digest)
}

// Constant-length comparison is enough here: both inputs are fixed-size
// digests computed locally, not attacker-controlled lengths.
pub fn digests_equal(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_alg_parse() {
        assert_eq!(DigestAlg::from_str("sha256").unwrap(), DigestAlg::Sha256);
        assert!(DigestAlg::from_str("md5").is_err());
    }

    #[test]
    fn test_hmac_differs_by_secret() {
        let a = hmac_sha256(b"secret-a", &[b"challenge"]).unwrap();
        let b = hmac_sha256(b"secret-b", &[b"challenge"]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_hmac_salting_changes_digest() {
        // salting the challenge with a node id must produce a different
        // response, otherwise replay between node pairs is possible
        let plain = hmac_sha256(b"secret", &[b"challenge"]).unwrap();
        let salted = hmac_sha256(b"secret", &[b"challenge", &1u32.to_be_bytes()]).unwrap();
        assert_ne!(plain, salted);
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(hmac_sha256(b"", &[b"x"]).is_err());
    }

    #[test]
    fn test_digests_equal() {
        let a = DigestAlg::Sha256.digest(&[b"data"]);
        let b = DigestAlg::Sha256.digest(&[b"data"]);
        let c = DigestAlg::Sha256.digest(&[b"other"]);
        assert!(digests_equal(&a, &b));
        assert!(!digests_equal(&a, &c));
    }
}
