// Cryptographic utilities

use anyhow::Result;
use base64::Engine;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// SHA-256 hex digest (lowercase).
pub fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Random alphanumeric string of `len` characters from the system CSPRNG.
pub fn random_string(len: usize) -> Result<String> {
    let rng = SystemRandom::new();
    let mut out = String::with_capacity(len);
    let mut byte = [0u8; 1];

    while out.len() < len {
        rng.fill(&mut byte)
            .map_err(|_| anyhow::anyhow!("Failed to generate random bytes"))?;
        // Rejection sampling keeps the distribution uniform (62 * 4 = 248).
        if byte[0] < 248 {
            out.push(ALPHANUMERIC[(byte[0] % 62) as usize] as char);
        }
    }

    Ok(out)
}

/// Random URL-safe token carrying `bytes` bytes of entropy.
pub fn random_token(bytes: usize) -> Result<String> {
    let mut buf = vec![0u8; bytes];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| anyhow::anyhow!("Failed to generate random bytes"))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn random_string_has_requested_length_and_alphabet() {
        let s = random_string(10).expect("random");
        assert_eq!(s.len(), 10);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn random_strings_differ() {
        let a = random_string(32).expect("random");
        let b = random_string(32).expect("random");
        assert_ne!(a, b);
    }

    #[test]
    fn random_token_is_url_safe() {
        let t = random_token(32).expect("token");
        assert_eq!(t.len(), 43);
        assert!(t.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
