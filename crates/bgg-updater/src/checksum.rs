// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of BGG Updater.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Streaming SHA-256 digest and verification module

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Hex length of a SHA-256 digest string
pub const DIGEST_HEX_LEN: usize = 64;

const READ_BUF_SIZE: usize = 8 * 1024;

/// Digest a reader in fixed-size chunks, lowercase hex output.
///
/// The reader is always consumed to EOF before the digest is produced;
/// verification never stops early on a prefix match.
pub fn digest_reader<R: Read>(mut reader: R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn digest_file(path: &Path) -> Result<String> {
    digest_reader(File::open(path)?)
}

/// Compare a file's digest against an expected hex string, case-insensitive
pub fn verify_file(path: &Path, expected_hex: &str) -> Result<bool> {
    let actual = digest_file(path)?;
    Ok(actual.eq_ignore_ascii_case(expected_hex))
}

/// True if `s` has the exact shape of a hex-encoded SHA-256 digest
pub fn is_hex_digest(s: &str) -> bool {
    s.len() == DIGEST_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // SHA-256 of "abc", a standard test vector
    const ABC_DIGEST: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_known_vector() {
        assert_eq!(digest_bytes(b"abc"), ABC_DIGEST);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(
            digest_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_reader_matches_bytes_across_chunk_boundary() {
        // Larger than READ_BUF_SIZE so the streaming path takes several reads
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let streamed = digest_reader(Cursor::new(&data)).unwrap();
        assert_eq!(streamed, digest_bytes(&data));
    }

    #[test]
    fn test_verify_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fw.bin");
        std::fs::write(&path, b"abc").unwrap();

        assert!(verify_file(&path, ABC_DIGEST).unwrap());
        assert!(verify_file(&path, &ABC_DIGEST.to_uppercase()).unwrap());
        assert!(!verify_file(&path, &digest_bytes(b"abd")).unwrap());
    }

    #[test]
    fn test_verify_missing_file_is_io_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(verify_file(&dir.path().join("absent"), ABC_DIGEST).is_err());
    }

    #[test]
    fn test_is_hex_digest() {
        assert!(is_hex_digest(ABC_DIGEST));
        assert!(is_hex_digest(&ABC_DIGEST.to_uppercase()));
        assert!(!is_hex_digest(&ABC_DIGEST[..63]));
        assert!(!is_hex_digest(&format!("{ABC_DIGEST}0")));
        assert!(!is_hex_digest(&format!("g{}", &ABC_DIGEST[1..])));
    }
}
