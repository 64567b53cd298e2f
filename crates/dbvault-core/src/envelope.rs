//! Backup encryption envelope
//!
//! Binary layout:
//!
//! ```text
//! magic "BRx1" (4) | version 1 (1) | salt (16) | nonce (12)
//! chunk ciphertexts: each plaintext chunk of up to 1 MiB + 16 B tag
//! footer: 16 B tag over the empty plaintext with the final chunk counter
//! ```
//!
//! The key is derived from the schedule password with Argon2id
//! (m=64 MiB, t=3, p=1). Each chunk is sealed with ChaCha20-Poly1305 under a
//! per-chunk nonce: the header nonce with the chunk counter XORed into its
//! last eight bytes. The footer authenticates the stream end, so truncation
//! is detected even on a chunk boundary.

use std::io::{Read, Write};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;

use crate::error::{Error, Result};

/// Envelope magic bytes.
pub const MAGIC: &[u8; 4] = b"BRx1";
/// Current envelope version.
pub const VERSION: u8 = 1;
/// Plaintext chunk size.
pub const CHUNK_SIZE: usize = 1024 * 1024;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 4 + 1 + SALT_LEN + NONCE_LEN;

/// Argon2id parameters: m=64 MiB, t=3, p=1.
fn kdf() -> Result<argon2::Argon2<'static>> {
    let params = argon2::Params::new(64 * 1024, 3, 1, Some(32))
        .map_err(|e| Error::Internal(format!("argon2 params: {}", e)))?;
    Ok(argon2::Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        params,
    ))
}

fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let mut key = [0u8; 32];
    kdf()?
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| Error::Internal(format!("envelope key derivation failed: {}", e)))?;
    Ok(key)
}

fn chunk_nonce(base: &[u8; NONCE_LEN], counter: u64) -> Nonce {
    let mut bytes = *base;
    let ctr = counter.to_be_bytes();
    for (b, c) in bytes[NONCE_LEN - 8..].iter_mut().zip(ctr.iter()) {
        *b ^= c;
    }
    Nonce::from(bytes)
}

/// Encrypt `reader` into `writer`. Returns the ciphertext byte count
/// (header and footer included).
pub fn seal<R: Read, W: Write>(reader: &mut R, writer: &mut W, password: &str) -> Result<u64> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce_base = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    rand::rngs::OsRng.fill_bytes(&mut nonce_base);

    let key = derive_key(password, &salt)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&key)
        .map_err(|e| Error::Internal(format!("cipher init: {}", e)))?;

    writer.write_all(MAGIC)?;
    writer.write_all(&[VERSION])?;
    writer.write_all(&salt)?;
    writer.write_all(&nonce_base)?;
    let mut written = HEADER_LEN as u64;

    let mut counter: u64 = 0;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = read_full(reader, &mut buf)?;
        if n == 0 {
            break;
        }
        let ct = cipher
            .encrypt(&chunk_nonce(&nonce_base, counter), &buf[..n])
            .map_err(|_| Error::Internal("chunk encryption failed".into()))?;
        writer.write_all(&ct)?;
        written += ct.len() as u64;
        counter += 1;
        if n < CHUNK_SIZE {
            break;
        }
    }

    // Footer: the empty plaintext under the final counter pins the length
    let footer = cipher
        .encrypt(&chunk_nonce(&nonce_base, counter), &[][..])
        .map_err(|_| Error::Internal("footer encryption failed".into()))?;
    debug_assert_eq!(footer.len(), TAG_LEN);
    writer.write_all(&footer)?;
    written += footer.len() as u64;

    writer.flush()?;
    Ok(written)
}

/// Decrypt `reader` into `writer`. Fails with `DECRYPT_FAILED` on a bad
/// header, wrong password, tampering, or truncation; no plaintext is written
/// before the first chunk authenticates.
pub fn open<R: Read, W: Write>(reader: &mut R, writer: &mut W, password: &str) -> Result<u64> {
    let mut header = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .map_err(|_| Error::DecryptFailed("truncated envelope header".into()))?;
    if &header[..4] != MAGIC {
        return Err(Error::DecryptFailed("bad envelope magic".into()));
    }
    if header[4] != VERSION {
        return Err(Error::DecryptFailed(format!(
            "unsupported envelope version {}",
            header[4]
        )));
    }
    let salt = &header[5..5 + SALT_LEN];
    let mut nonce_base = [0u8; NONCE_LEN];
    nonce_base.copy_from_slice(&header[5 + SALT_LEN..]);

    let key = derive_key(password, salt)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&key)
        .map_err(|e| Error::Internal(format!("cipher init: {}", e)))?;

    const FULL_CT: usize = CHUNK_SIZE + TAG_LEN;

    // Keep TAG_LEN bytes of lookahead so the footer is never mistaken for
    // chunk data.
    let mut pending: Vec<u8> = Vec::with_capacity(FULL_CT + TAG_LEN);
    let mut counter: u64 = 0;
    let mut written: u64 = 0;
    let mut eof = false;

    loop {
        while !eof && pending.len() < FULL_CT + TAG_LEN {
            let mut chunk = [0u8; 64 * 1024];
            let want = (FULL_CT + TAG_LEN - pending.len()).min(chunk.len());
            let n = reader.read(&mut chunk[..want])?;
            if n == 0 {
                eof = true;
            } else {
                pending.extend_from_slice(&chunk[..n]);
            }
        }

        if eof && pending.len() <= FULL_CT + TAG_LEN {
            if pending.len() < TAG_LEN {
                return Err(Error::DecryptFailed("truncated envelope".into()));
            }
            let footer_at = pending.len() - TAG_LEN;
            let (body, footer) = pending.split_at(footer_at);
            if !body.is_empty() {
                if body.len() < TAG_LEN {
                    return Err(Error::DecryptFailed("truncated final chunk".into()));
                }
                let plain = cipher
                    .decrypt(&chunk_nonce(&nonce_base, counter), body)
                    .map_err(|_| Error::DecryptFailed("chunk authentication failed".into()))?;
                writer.write_all(&plain)?;
                written += plain.len() as u64;
                counter += 1;
            }
            let empty = cipher
                .decrypt(&chunk_nonce(&nonce_base, counter), footer)
                .map_err(|_| Error::DecryptFailed("envelope footer mismatch".into()))?;
            if !empty.is_empty() {
                return Err(Error::DecryptFailed("envelope footer mismatch".into()));
            }
            break;
        }

        // A full chunk plus lookahead is buffered
        let plain = cipher
            .decrypt(&chunk_nonce(&nonce_base, counter), &pending[..FULL_CT])
            .map_err(|_| Error::DecryptFailed("chunk authentication failed".into()))?;
        writer.write_all(&plain)?;
        written += plain.len() as u64;
        counter += 1;
        pending.drain(..FULL_CT);
    }

    writer.flush()?;
    Ok(written)
}

/// Read until `buf` is full or EOF; returns the byte count.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(data: &[u8], password: &str) -> Vec<u8> {
        let mut sealed = Vec::new();
        seal(&mut Cursor::new(data), &mut sealed, password).unwrap();
        let mut opened = Vec::new();
        open(&mut Cursor::new(&sealed), &mut opened, password).unwrap();
        opened
    }

    #[test]
    fn test_roundtrip_small() {
        let data = b"logical dump bytes";
        assert_eq!(roundtrip(data, "hunter2"), data);
    }

    #[test]
    fn test_roundtrip_empty() {
        assert_eq!(roundtrip(b"", "hunter2"), b"");
    }

    #[test]
    fn test_roundtrip_multiple_chunks() {
        // Exercise exact-boundary and spill-over sizes
        for size in [CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1, 2 * CHUNK_SIZE + 7] {
            let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            assert_eq!(roundtrip(&data, "pw"), data, "size {}", size);
        }
    }

    #[test]
    fn test_wrong_password_writes_nothing() {
        let mut sealed = Vec::new();
        seal(&mut Cursor::new(b"secret data"), &mut sealed, "right").unwrap();

        let mut out = Vec::new();
        let err = open(&mut Cursor::new(&sealed), &mut out, "wrong").unwrap_err();
        assert_eq!(err.kind().code(), "DECRYPT_FAILED");
        assert!(out.is_empty());
    }

    #[test]
    fn test_bad_magic() {
        let mut sealed = Vec::new();
        seal(&mut Cursor::new(b"data"), &mut sealed, "pw").unwrap();
        sealed[0] = b'X';

        let mut out = Vec::new();
        let err = open(&mut Cursor::new(&sealed), &mut out, "pw").unwrap_err();
        assert_eq!(err.kind().code(), "DECRYPT_FAILED");
    }

    #[test]
    fn test_truncation_detected() {
        let mut sealed = Vec::new();
        seal(&mut Cursor::new(b"data worth keeping"), &mut sealed, "pw").unwrap();
        // Drop the footer entirely
        sealed.truncate(sealed.len() - TAG_LEN);

        let mut out = Vec::new();
        let err = open(&mut Cursor::new(&sealed), &mut out, "pw").unwrap_err();
        assert_eq!(err.kind().code(), "DECRYPT_FAILED");
    }

    #[test]
    fn test_tampered_chunk_detected() {
        let mut sealed = Vec::new();
        seal(&mut Cursor::new(b"data worth keeping"), &mut sealed, "pw").unwrap();
        let mid = HEADER_LEN + 3;
        sealed[mid] ^= 0x01;

        let mut out = Vec::new();
        let err = open(&mut Cursor::new(&sealed), &mut out, "pw").unwrap_err();
        assert_eq!(err.kind().code(), "DECRYPT_FAILED");
    }

    #[test]
    fn test_header_shape() {
        let mut sealed = Vec::new();
        seal(&mut Cursor::new(b"x"), &mut sealed, "pw").unwrap();
        assert_eq!(&sealed[..4], MAGIC);
        assert_eq!(sealed[4], VERSION);
        // header + (1 byte + tag) chunk + footer tag
        assert_eq!(sealed.len(), HEADER_LEN + 1 + TAG_LEN + TAG_LEN);
    }
}
