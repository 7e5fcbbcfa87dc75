//! Stored-value framing: `flags_byte || [expiry_u64_le]? || payload`.
//!
//! Flag bit 0 says an 8-byte absolute expiry (milliseconds since the epoch)
//! follows the flags byte; bit 1 says the payload is LZ4-compressed; bit 2
//! says the payload is AEAD ciphertext carrying its 12-byte nonce as a
//! prefix. Compression runs before encryption on the way in.

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};

use skdb_common::{Error, Result, MIN_COMPRESS_SIZE};

type Aes192Gcm = AesGcm<aes_gcm::aes::Aes192, U12>;

const NONCE_LEN: usize = 12;

pub const FLAG_HAS_EXPIRY: u8 = 1 << 0;
pub const FLAG_COMPRESSED: u8 = 1 << 1;
pub const FLAG_ENCRYPTED: u8 = 1 << 2;

const KNOWN_FLAGS: u8 = FLAG_HAS_EXPIRY | FLAG_COMPRESSED | FLAG_ENCRYPTED;

/// A decoded stored value. Expiry evaluation is the caller's business —
/// the codec only reports what the frame says.
#[derive(Debug, PartialEq, Eq)]
pub struct Decoded {
    pub value: Vec<u8>,
    pub expiry_ms: Option<u64>,
}

enum Cipher {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

impl Cipher {
    fn from_key(key: &[u8]) -> Result<Cipher> {
        let bad = || Error::bad_input("unusable encryption key");
        match key.len() {
            16 => Ok(Cipher::Aes128(Aes128Gcm::new_from_slice(key).map_err(|_| bad())?)),
            24 => Ok(Cipher::Aes192(Aes192Gcm::new_from_slice(key).map_err(|_| bad())?)),
            32 => Ok(Cipher::Aes256(Aes256Gcm::new_from_slice(key).map_err(|_| bad())?)),
            n => Err(Error::BadInput(format!(
                "encryption key must be 16, 24, or 32 bytes, got {n}"
            ))),
        }
    }

    /// Seal with a fresh random nonce, returning `nonce || ciphertext`.
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce_bytes)
            .map_err(|e| Error::Io(std::io::Error::other(format!("nonce: {e}"))))?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = match self {
            Cipher::Aes128(c) => c.encrypt(nonce, plain),
            Cipher::Aes192(c) => c.encrypt(nonce, plain),
            Cipher::Aes256(c) => c.encrypt(nonce, plain),
        }
        .map_err(|_| Error::corrupt("value encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(Error::corrupt("ciphertext shorter than its nonce"));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        match self {
            Cipher::Aes128(c) => c.decrypt(nonce, ciphertext),
            Cipher::Aes192(c) => c.decrypt(nonce, ciphertext),
            Cipher::Aes256(c) => c.decrypt(nonce, ciphertext),
        }
        .map_err(|_| Error::corrupt("value failed authentication"))
    }
}

/// Encoder/decoder configured once per database from the open options.
pub struct Codec {
    compress: bool,
    cipher: Option<Cipher>,
}

impl Codec {
    pub fn new(compress: bool, encryption_key: Option<&[u8]>) -> Result<Codec> {
        let cipher = match encryption_key {
            Some(key) => Some(Cipher::from_key(key)?),
            None => None,
        };
        Ok(Codec { compress, cipher })
    }

    pub fn encryption_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn compression_default(&self) -> bool {
        self.compress
    }

    /// Frame a user value for storage.
    ///
    /// Compression is attempted only for payloads of at least
    /// `MIN_COMPRESS_SIZE` bytes and kept only when strictly smaller than
    /// the input; otherwise the flag stays clear and the raw bytes are
    /// stored.
    pub fn encode(&self, value: &[u8], expiry_ms: Option<u64>) -> Result<Vec<u8>> {
        let mut flags = 0u8;
        let mut payload = std::borrow::Cow::Borrowed(value);

        if self.compress && value.len() >= MIN_COMPRESS_SIZE {
            let compressed = lz4_flex::compress_prepend_size(value);
            if compressed.len() < value.len() {
                flags |= FLAG_COMPRESSED;
                payload = std::borrow::Cow::Owned(compressed);
            }
        }

        if let Some(cipher) = &self.cipher {
            flags |= FLAG_ENCRYPTED;
            payload = std::borrow::Cow::Owned(cipher.encrypt(&payload)?);
        }

        let mut out = Vec::with_capacity(1 + 8 + payload.len());
        if expiry_ms.is_some() {
            flags |= FLAG_HAS_EXPIRY;
        }
        out.push(flags);
        if let Some(expiry) = expiry_ms {
            out.extend_from_slice(&expiry.to_le_bytes());
        }
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Unframe a stored value.
    pub fn decode(&self, stored: &[u8]) -> Result<Decoded> {
        let (&flags, rest) = stored
            .split_first()
            .ok_or_else(|| Error::corrupt("empty stored value"))?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(Error::Corrupt(format!("unknown value flags {flags:#04x}")));
        }

        let (expiry_ms, payload) = if flags & FLAG_HAS_EXPIRY != 0 {
            if rest.len() < 8 {
                return Err(Error::corrupt("stored value truncated before expiry"));
            }
            let (expiry, payload) = rest.split_at(8);
            (Some(u64::from_le_bytes(expiry.try_into().unwrap())), payload)
        } else {
            (None, rest)
        };

        let mut value = payload.to_vec();
        if flags & FLAG_ENCRYPTED != 0 {
            let cipher = self
                .cipher
                .as_ref()
                .ok_or_else(|| Error::corrupt("encrypted value but no key configured"))?;
            value = cipher.decrypt(&value)?;
        }
        if flags & FLAG_COMPRESSED != 0 {
            value = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| Error::Corrupt(format!("lz4: {e}")))?;
        }

        Ok(Decoded { value, expiry_ms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_round_trip() {
        let codec = Codec::new(false, None).unwrap();
        let stored = codec.encode(b"hello", None).unwrap();
        assert_eq!(stored[0], 0);
        assert_eq!(&stored[1..], b"hello");
        let decoded = codec.decode(&stored).unwrap();
        assert_eq!(decoded.value, b"hello");
        assert_eq!(decoded.expiry_ms, None);
    }

    #[test]
    fn test_expiry_round_trip() {
        let codec = Codec::new(false, None).unwrap();
        let stored = codec.encode(b"v", Some(987_654)).unwrap();
        assert_eq!(stored[0] & FLAG_HAS_EXPIRY, FLAG_HAS_EXPIRY);
        let decoded = codec.decode(&stored).unwrap();
        assert_eq!(decoded.expiry_ms, Some(987_654));
        assert_eq!(decoded.value, b"v");
    }

    #[test]
    fn test_compressible_value_shrinks() {
        let codec = Codec::new(true, None).unwrap();
        let value = vec![b'a'; 1024];
        let stored = codec.encode(&value, None).unwrap();
        assert_eq!(stored[0] & FLAG_COMPRESSED, FLAG_COMPRESSED);
        assert!(stored.len() < value.len());
        assert_eq!(codec.decode(&stored).unwrap().value, value);
    }

    #[test]
    fn test_small_value_skips_compression() {
        let codec = Codec::new(true, None).unwrap();
        let value = vec![b'a'; MIN_COMPRESS_SIZE - 1];
        let stored = codec.encode(&value, None).unwrap();
        assert_eq!(stored[0] & FLAG_COMPRESSED, 0);
        assert_eq!(&stored[1..], value.as_slice());
    }

    #[test]
    fn test_incompressible_value_keeps_raw_bytes() {
        let codec = Codec::new(true, None).unwrap();
        // A byte spread with no repetition defeats LZ4.
        let value: Vec<u8> = (0..=255u8).cycle().take(256).collect();
        let stored = codec.encode(&value, None).unwrap();
        if stored[0] & FLAG_COMPRESSED == 0 {
            assert_eq!(&stored[1..], value.as_slice());
        }
        assert_eq!(codec.decode(&stored).unwrap().value, value);
    }

    #[test]
    fn test_encryption_round_trip_all_key_sizes() {
        for key_len in [16usize, 24, 32] {
            let key = vec![0x42u8; key_len];
            let codec = Codec::new(false, Some(&key)).unwrap();
            let stored = codec.encode(b"secret", Some(5)).unwrap();
            assert_eq!(stored[0] & FLAG_ENCRYPTED, FLAG_ENCRYPTED);
            // flags + expiry + nonce + ciphertext(+tag): never the plaintext.
            assert!(!stored.windows(6).any(|w| w == b"secret"));
            let decoded = codec.decode(&stored).unwrap();
            assert_eq!(decoded.value, b"secret");
            assert_eq!(decoded.expiry_ms, Some(5));
        }
    }

    #[test]
    fn test_distinct_nonces_per_write() {
        let codec = Codec::new(false, Some(&[7u8; 32])).unwrap();
        let a = codec.encode(b"same", None).unwrap();
        let b = codec.encode(b"same", None).unwrap();
        assert_ne!(a[1..13], b[1..13]);
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let codec = Codec::new(false, Some(&[1u8; 32])).unwrap();
        let stored = codec.encode(b"secret", None).unwrap();
        let other = Codec::new(false, Some(&[2u8; 32])).unwrap();
        assert!(matches!(other.decode(&stored), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_tampered_ciphertext_detected() {
        let codec = Codec::new(false, Some(&[9u8; 16])).unwrap();
        let mut stored = codec.encode(b"payload", None).unwrap();
        let last = stored.len() - 1;
        stored[last] ^= 0x01;
        assert!(matches!(codec.decode(&stored), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_bad_key_length_rejected() {
        assert!(matches!(Codec::new(false, Some(&[0u8; 17])), Err(Error::BadInput(_))));
    }

    #[test]
    fn test_unknown_flags_rejected() {
        let codec = Codec::new(false, None).unwrap();
        assert!(matches!(codec.decode(&[0x80, 1, 2]), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_compression_with_encryption_composes() {
        let codec = Codec::new(true, Some(&[5u8; 32])).unwrap();
        let value = vec![b'z'; 2048];
        let stored = codec.encode(&value, None).unwrap();
        assert_eq!(
            stored[0] & (FLAG_COMPRESSED | FLAG_ENCRYPTED),
            FLAG_COMPRESSED | FLAG_ENCRYPTED
        );
        assert!(stored.len() < value.len());
        assert_eq!(codec.decode(&stored).unwrap().value, value);
    }
}
