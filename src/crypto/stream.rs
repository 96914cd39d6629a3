use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use zeroize::Zeroize;

use super::engine::{CryptoError, CryptoResult, NONCE_LENGTH, TAG_LENGTH};
use super::keys::DerivedKey;

pub const CHUNK_SIZE: usize = 1024 * 1024;
const STREAM_MAGIC: &[u8; 4] = b"PVST";
const STREAM_VERSION: u32 = 1;

// A ciphertext chunk is plaintext + tag; anything larger is a framing error.
const MAX_CHUNK_CIPHERTEXT: usize = CHUNK_SIZE + TAG_LENGTH;

/// Cleartext header preceding the chunk sequence. Carries no information
/// about the protected content beyond its length.
#[derive(Serialize, Deserialize, Debug)]
struct StreamHeader {
    stream_id: [u8; 16],
    base_nonce: [u8; NONCE_LENGTH],
    chunk_size: u32,
    plaintext_len: u64,
}

/// Per-chunk nonce: the low eight bytes of the base nonce XOR the chunk
/// counter. Unique for every chunk as long as the base nonce is fresh per
/// stream.
fn chunk_nonce(base: &[u8; NONCE_LENGTH], index: u64) -> [u8; NONCE_LENGTH] {
    let mut nonce = *base;
    let index_bytes = index.to_le_bytes();
    for i in 0..8 {
        nonce[4 + i] ^= index_bytes[i];
    }
    nonce
}

/// AAD binds each chunk to its stream and position so chunks cannot be
/// reordered, dropped, or transplanted between streams.
fn chunk_aad(stream_id: &[u8; 16], index: u64) -> String {
    format!("{}:{}", hex::encode(stream_id), index)
}

/// Encrypt `reader` into `writer` in fixed-size chunks. `stream_id` is the
/// caller's opaque identifier for this stream (it is authenticated, not
/// secret). Returns the number of plaintext bytes consumed.
pub fn encrypt_stream(
    key: &DerivedKey,
    stream_id: [u8; 16],
    plaintext_len: u64,
    reader: &mut impl Read,
    writer: &mut impl Write,
) -> CryptoResult<u64> {
    let cipher =
        Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::InvalidKeySize)?;

    let mut base_nonce = [0u8; NONCE_LENGTH];
    OsRng
        .try_fill_bytes(&mut base_nonce)
        .map_err(|_| CryptoError::CsprngUnavailable)?;

    writer.write_all(STREAM_MAGIC)?;
    writer.write_u32::<LittleEndian>(STREAM_VERSION)?;

    let header = StreamHeader {
        stream_id,
        base_nonce,
        chunk_size: CHUNK_SIZE as u32,
        plaintext_len,
    };
    let header_bytes =
        bincode::serialize(&header).map_err(|_| CryptoError::EncryptionFailed)?;
    writer.write_u32::<LittleEndian>(header_bytes.len() as u32)?;
    writer.write_all(&header_bytes)?;

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut chunk_index: u64 = 0;
    let mut processed: u64 = 0;

    loop {
        let bytes_read = read_full_chunk(reader, &mut buffer)?;
        if bytes_read == 0 {
            break;
        }

        let nonce = chunk_nonce(&base_nonce, chunk_index);
        let aad = chunk_aad(&stream_id, chunk_index);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &buffer[..bytes_read],
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        writer.write_u32::<LittleEndian>(ciphertext.len() as u32)?;
        writer.write_all(&ciphertext)?;

        processed += bytes_read as u64;
        chunk_index += 1;

        if bytes_read < CHUNK_SIZE {
            break;
        }
    }

    buffer.zeroize();
    writer.flush()?;

    if processed != plaintext_len {
        return Err(CryptoError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "source changed size during encryption",
        )));
    }
    Ok(processed)
}

/// Decrypt a stream produced by [`encrypt_stream`]. When `expected_id` is
/// given, a stream with any other id is rejected before the first chunk is
/// decrypted. Returns the number of plaintext bytes written.
pub fn decrypt_stream(
    key: &DerivedKey,
    expected_id: Option<&[u8; 16]>,
    reader: &mut impl Read,
    writer: &mut impl Write,
) -> CryptoResult<u64> {
    let cipher =
        Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::InvalidKeySize)?;

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != STREAM_MAGIC {
        return Err(CryptoError::InvalidTag);
    }
    let version = reader.read_u32::<LittleEndian>()?;
    if version != STREAM_VERSION {
        return Err(CryptoError::InvalidTag);
    }

    let header_len = reader.read_u32::<LittleEndian>()? as usize;
    if header_len > 4096 {
        return Err(CryptoError::InvalidTag);
    }
    let mut header_bytes = vec![0u8; header_len];
    reader.read_exact(&mut header_bytes)?;
    let header: StreamHeader =
        bincode::deserialize(&header_bytes).map_err(|_| CryptoError::InvalidTag)?;

    if let Some(expected) = expected_id {
        if &header.stream_id != expected {
            return Err(CryptoError::InvalidTag);
        }
    }
    if header.chunk_size as usize != CHUNK_SIZE {
        return Err(CryptoError::InvalidTag);
    }

    let mut chunk_index: u64 = 0;
    let mut written: u64 = 0;

    loop {
        let chunk_len = match reader.read_u32::<LittleEndian>() {
            Ok(len) => len as usize,
            Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(CryptoError::Io(e)),
        };
        if chunk_len > MAX_CHUNK_CIPHERTEXT || chunk_len < TAG_LENGTH {
            return Err(CryptoError::InvalidTag);
        }

        let mut ciphertext = vec![0u8; chunk_len];
        reader.read_exact(&mut ciphertext)?;

        let nonce = chunk_nonce(&header.base_nonce, chunk_index);
        let aad = chunk_aad(&header.stream_id, chunk_index);
        let mut plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::InvalidTag)?;

        writer.write_all(&plaintext)?;
        written += plaintext.len() as u64;
        plaintext.zeroize();
        chunk_index += 1;
    }

    writer.flush()?;

    // Truncation of whole trailing chunks is not caught by per-chunk tags.
    if written != header.plaintext_len {
        return Err(CryptoError::InvalidTag);
    }
    Ok(written)
}

/// Read until the buffer is full or the reader is exhausted. A plain
/// `read()` may return short counts on pipes and network-backed mounts.
fn read_full_chunk(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
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

    fn key() -> DerivedKey {
        DerivedKey::from_bytes(&[0x42; 32]).unwrap()
    }

    fn roundtrip(data: &[u8]) -> Vec<u8> {
        let mut encrypted = Vec::new();
        encrypt_stream(
            &key(),
            [9u8; 16],
            data.len() as u64,
            &mut Cursor::new(data),
            &mut encrypted,
        )
        .unwrap();

        let mut decrypted = Vec::new();
        decrypt_stream(&key(), Some(&[9u8; 16]), &mut Cursor::new(&encrypted), &mut decrypted)
            .unwrap();
        decrypted
    }

    #[test]
    fn test_roundtrip_small() {
        assert_eq!(roundtrip(b"hello\n"), b"hello\n");
    }

    #[test]
    fn test_roundtrip_empty() {
        assert_eq!(roundtrip(b""), b"");
    }

    #[test]
    fn test_roundtrip_multi_chunk() {
        let data: Vec<u8> = (0..(2 * CHUNK_SIZE + 77)).map(|i| (i % 251) as u8).collect();
        assert_eq!(roundtrip(&data), data);
    }

    #[test]
    fn test_roundtrip_exact_chunk_boundary() {
        let data = vec![0xabu8; CHUNK_SIZE];
        assert_eq!(roundtrip(&data), data);
    }

    #[test]
    fn test_bitflip_detected() {
        let data = vec![0x11u8; CHUNK_SIZE + 100];
        let mut encrypted = Vec::new();
        encrypt_stream(
            &key(),
            [9u8; 16],
            data.len() as u64,
            &mut Cursor::new(&data),
            &mut encrypted,
        )
        .unwrap();

        // Flip one byte inside the first chunk's ciphertext.
        let mid = encrypted.len() / 2;
        encrypted[mid] ^= 0x80;

        let mut out = Vec::new();
        let err = decrypt_stream(&key(), None, &mut Cursor::new(&encrypted), &mut out);
        assert!(matches!(err, Err(CryptoError::InvalidTag)));
    }

    #[test]
    fn test_truncated_stream_detected() {
        let data = vec![0x22u8; CHUNK_SIZE * 2];
        let mut encrypted = Vec::new();
        encrypt_stream(
            &key(),
            [9u8; 16],
            data.len() as u64,
            &mut Cursor::new(&data),
            &mut encrypted,
        )
        .unwrap();

        // Drop the last chunk record entirely.
        let cut = encrypted.len() - (CHUNK_SIZE + TAG_LENGTH + 4);
        encrypted.truncate(cut);

        let mut out = Vec::new();
        assert!(decrypt_stream(&key(), None, &mut Cursor::new(&encrypted), &mut out).is_err());
    }

    #[test]
    fn test_wrong_stream_id_rejected() {
        let mut encrypted = Vec::new();
        encrypt_stream(
            &key(),
            [1u8; 16],
            5,
            &mut Cursor::new(b"12345"),
            &mut encrypted,
        )
        .unwrap();

        let mut out = Vec::new();
        let err = decrypt_stream(&key(), Some(&[2u8; 16]), &mut Cursor::new(&encrypted), &mut out);
        assert!(matches!(err, Err(CryptoError::InvalidTag)));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let mut encrypted = Vec::new();
        encrypt_stream(
            &key(),
            [1u8; 16],
            5,
            &mut Cursor::new(b"12345"),
            &mut encrypted,
        )
        .unwrap();

        let other = DerivedKey::from_bytes(&[0x43; 32]).unwrap();
        let mut out = Vec::new();
        assert!(decrypt_stream(&other, None, &mut Cursor::new(&encrypted), &mut out).is_err());
    }

    #[test]
    fn test_chunk_nonces_distinct() {
        let base = [7u8; NONCE_LENGTH];
        let mut seen = std::collections::HashSet::new();
        for i in 0..1000 {
            assert!(seen.insert(chunk_nonce(&base, i)));
        }
    }
}
