//! Cipher and integrity algorithm identifiers
//!
//! The IKE layer negotiates transforms by IKEv2 transform ID (RFC 7296
//! Section 3.3.2) and hands the result down as opaque identifiers plus key
//! bytes. This module maps those identifiers to the key sizes the kernel
//! requires and to the kernel's algorithm names.
//!
//! Key lengths for counter-mode and AEAD ciphers include the 4-byte salt
//! (RFC 3686, RFC 4106, RFC 7634), which is how the kernel expects them.

use super::error::SaError;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Encryption algorithm for ESP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CipherId {
    /// NULL encryption (RFC 2410)
    Null,
    /// 3DES-CBC
    TripleDes,
    /// AES-CBC with 128-bit key
    AesCbc128,
    /// AES-CBC with 192-bit key
    AesCbc192,
    /// AES-CBC with 256-bit key
    AesCbc256,
    /// AES-CTR with 128-bit key
    AesCtr128,
    /// AES-CTR with 256-bit key
    AesCtr256,
    /// AES-GCM with 128-bit key and 16-byte ICV (AEAD)
    AesGcm128,
    /// AES-GCM with 256-bit key and 16-byte ICV (AEAD)
    AesGcm256,
    /// ChaCha20-Poly1305 (AEAD)
    ChaCha20Poly1305,
}

impl CipherId {
    /// Required key length in bytes
    pub fn key_len(self) -> usize {
        match self {
            CipherId::Null => 0,
            CipherId::TripleDes => 24,
            CipherId::AesCbc128 => 16,
            CipherId::AesCbc192 => 24,
            CipherId::AesCbc256 => 32,
            CipherId::AesCtr128 => 20,
            CipherId::AesCtr256 => 36,
            CipherId::AesGcm128 => 20,
            CipherId::AesGcm256 => 36,
            CipherId::ChaCha20Poly1305 => 36,
        }
    }

    /// IKEv2 transform ID
    pub fn transform_id(self) -> u16 {
        match self {
            CipherId::TripleDes => 3,
            CipherId::Null => 11,
            CipherId::AesCbc128 | CipherId::AesCbc192 | CipherId::AesCbc256 => 12,
            CipherId::AesCtr128 | CipherId::AesCtr256 => 13,
            CipherId::AesGcm128 | CipherId::AesGcm256 => 20,
            CipherId::ChaCha20Poly1305 => 28,
        }
    }

    /// Resolve a negotiated transform ID and Key Length attribute (in bits)
    pub fn from_transform(transform_id: u16, key_bits: Option<u16>) -> Option<Self> {
        match (transform_id, key_bits) {
            (3, None) => Some(CipherId::TripleDes),
            (11, None) => Some(CipherId::Null),
            (12, Some(128)) => Some(CipherId::AesCbc128),
            (12, Some(192)) => Some(CipherId::AesCbc192),
            (12, Some(256)) => Some(CipherId::AesCbc256),
            (13, Some(128)) => Some(CipherId::AesCtr128),
            (13, Some(256)) => Some(CipherId::AesCtr256),
            (20, Some(128)) => Some(CipherId::AesGcm128),
            (20, Some(256)) => Some(CipherId::AesGcm256),
            (28, None) => Some(CipherId::ChaCha20Poly1305),
            _ => None,
        }
    }

    /// Kernel crypto API name
    pub fn kernel_name(self) -> &'static str {
        match self {
            CipherId::Null => "ecb(cipher_null)",
            CipherId::TripleDes => "cbc(des3_ede)",
            CipherId::AesCbc128 | CipherId::AesCbc192 | CipherId::AesCbc256 => "cbc(aes)",
            CipherId::AesCtr128 | CipherId::AesCtr256 => "rfc3686(ctr(aes))",
            CipherId::AesGcm128 | CipherId::AesGcm256 => "rfc4106(gcm(aes))",
            CipherId::ChaCha20Poly1305 => "rfc7539esp(chacha20,poly1305)",
        }
    }

    /// Whether this is a combined-mode (AEAD) cipher
    pub fn is_aead(self) -> bool {
        matches!(
            self,
            CipherId::AesGcm128 | CipherId::AesGcm256 | CipherId::ChaCha20Poly1305
        )
    }

    /// ICV length in bits (AEAD ciphers only)
    pub fn icv_bits(self) -> Option<u32> {
        if self.is_aead() {
            Some(128)
        } else {
            None
        }
    }
}

impl fmt::Display for CipherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CipherId::Null => "NULL",
            CipherId::TripleDes => "3DES-CBC",
            CipherId::AesCbc128 => "AES-CBC-128",
            CipherId::AesCbc192 => "AES-CBC-192",
            CipherId::AesCbc256 => "AES-CBC-256",
            CipherId::AesCtr128 => "AES-CTR-128",
            CipherId::AesCtr256 => "AES-CTR-256",
            CipherId::AesGcm128 => "AES-GCM-128",
            CipherId::AesGcm256 => "AES-GCM-256",
            CipherId::ChaCha20Poly1305 => "ChaCha20-Poly1305",
        };
        write!(f, "{}", name)
    }
}

/// Integrity algorithm for AH and non-AEAD ESP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u16)]
pub enum IntegrityId {
    /// HMAC-MD5-96
    HmacMd5_96 = 1,
    /// HMAC-SHA1-96
    HmacSha1_96 = 2,
    /// AES-XCBC-MAC-96
    AesXcbc96 = 5,
    /// HMAC-SHA2-256-128
    HmacSha256_128 = 12,
    /// HMAC-SHA2-384-192
    HmacSha384_192 = 13,
    /// HMAC-SHA2-512-256
    HmacSha512_256 = 14,
}

impl IntegrityId {
    /// Convert from IKEv2 transform ID
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(IntegrityId::HmacMd5_96),
            2 => Some(IntegrityId::HmacSha1_96),
            5 => Some(IntegrityId::AesXcbc96),
            12 => Some(IntegrityId::HmacSha256_128),
            13 => Some(IntegrityId::HmacSha384_192),
            14 => Some(IntegrityId::HmacSha512_256),
            _ => None,
        }
    }

    /// IKEv2 transform ID
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Required key length in bytes
    pub fn key_len(self) -> usize {
        match self {
            IntegrityId::HmacMd5_96 => 16,
            IntegrityId::HmacSha1_96 => 20,
            IntegrityId::AesXcbc96 => 16,
            IntegrityId::HmacSha256_128 => 32,
            IntegrityId::HmacSha384_192 => 48,
            IntegrityId::HmacSha512_256 => 64,
        }
    }

    /// Truncated ICV length in bits
    pub fn truncation_bits(self) -> u32 {
        match self {
            IntegrityId::HmacMd5_96 | IntegrityId::HmacSha1_96 | IntegrityId::AesXcbc96 => 96,
            IntegrityId::HmacSha256_128 => 128,
            IntegrityId::HmacSha384_192 => 192,
            IntegrityId::HmacSha512_256 => 256,
        }
    }

    /// Kernel crypto API name
    pub fn kernel_name(self) -> &'static str {
        match self {
            IntegrityId::HmacMd5_96 => "hmac(md5)",
            IntegrityId::HmacSha1_96 => "hmac(sha1)",
            IntegrityId::AesXcbc96 => "xcbc(aes)",
            IntegrityId::HmacSha256_128 => "hmac(sha256)",
            IntegrityId::HmacSha384_192 => "hmac(sha384)",
            IntegrityId::HmacSha512_256 => "hmac(sha512)",
        }
    }
}

impl fmt::Display for IntegrityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IntegrityId::HmacMd5_96 => "HMAC-MD5-96",
            IntegrityId::HmacSha1_96 => "HMAC-SHA1-96",
            IntegrityId::AesXcbc96 => "AES-XCBC-96",
            IntegrityId::HmacSha256_128 => "HMAC-SHA2-256-128",
            IntegrityId::HmacSha384_192 => "HMAC-SHA2-384-192",
            IntegrityId::HmacSha512_256 => "HMAC-SHA2-512-256",
        };
        write!(f, "{}", name)
    }
}

/// Cipher choice plus key material
///
/// The key is wiped when the value is dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey {
    #[zeroize(skip)]
    id: CipherId,
    key: Vec<u8>,
}

impl CipherKey {
    /// Pair a cipher with its key
    pub fn new(id: CipherId, key: impl Into<Vec<u8>>) -> Self {
        CipherKey {
            id,
            key: key.into(),
        }
    }

    /// Cipher identifier
    pub fn id(&self) -> CipherId {
        self.id
    }

    /// Raw key bytes
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Check the key length against the cipher
    pub fn check_len(&self) -> Result<(), SaError> {
        if self.key.len() != self.id.key_len() {
            return Err(SaError::BadKeyLength {
                algorithm: self.id.kernel_name(),
                expected: self.id.key_len(),
                actual: self.key.len(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherKey")
            .field("id", &self.id)
            .field("key_len", &self.key.len())
            .finish()
    }
}

/// Integrity choice plus key material
///
/// The key is wiped when the value is dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct IntegrityKey {
    #[zeroize(skip)]
    id: IntegrityId,
    key: Vec<u8>,
}

impl IntegrityKey {
    /// Pair an integrity algorithm with its key
    pub fn new(id: IntegrityId, key: impl Into<Vec<u8>>) -> Self {
        IntegrityKey {
            id,
            key: key.into(),
        }
    }

    /// Integrity algorithm identifier
    pub fn id(&self) -> IntegrityId {
        self.id
    }

    /// Raw key bytes
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Check the key length against the algorithm
    pub fn check_len(&self) -> Result<(), SaError> {
        if self.key.len() != self.id.key_len() {
            return Err(SaError::BadKeyLength {
                algorithm: self.id.kernel_name(),
                expected: self.id.key_len(),
                actual: self.key.len(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for IntegrityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrityKey")
            .field("id", &self.id)
            .field("key_len", &self.key.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_key_lengths() {
        assert_eq!(CipherId::AesCbc128.key_len(), 16);
        assert_eq!(CipherId::AesCbc256.key_len(), 32);
        assert_eq!(CipherId::AesGcm128.key_len(), 20); // 16 + 4 salt
        assert_eq!(CipherId::ChaCha20Poly1305.key_len(), 36);
        assert_eq!(CipherId::Null.key_len(), 0);
    }

    #[test]
    fn test_cipher_transform_mapping() {
        assert_eq!(
            CipherId::from_transform(12, Some(128)),
            Some(CipherId::AesCbc128)
        );
        assert_eq!(
            CipherId::from_transform(20, Some(256)),
            Some(CipherId::AesGcm256)
        );
        assert_eq!(CipherId::from_transform(12, None), None);
        assert_eq!(CipherId::from_transform(99, None), None);

        for (id, bits) in [
            (CipherId::TripleDes, None),
            (CipherId::AesCbc192, Some(192)),
            (CipherId::AesCtr256, Some(256)),
            (CipherId::ChaCha20Poly1305, None),
        ] {
            assert_eq!(CipherId::from_transform(id.transform_id(), bits), Some(id));
        }
    }

    #[test]
    fn test_aead_flags() {
        assert!(CipherId::AesGcm128.is_aead());
        assert!(CipherId::ChaCha20Poly1305.is_aead());
        assert!(!CipherId::AesCbc128.is_aead());
        assert_eq!(CipherId::AesGcm256.icv_bits(), Some(128));
        assert_eq!(CipherId::AesCtr128.icv_bits(), None);
    }

    #[test]
    fn test_integrity_mapping() {
        assert_eq!(IntegrityId::from_u16(1), Some(IntegrityId::HmacMd5_96));
        assert_eq!(IntegrityId::HmacSha256_128.to_u16(), 12);
        assert_eq!(IntegrityId::HmacMd5_96.key_len(), 16);
        assert_eq!(IntegrityId::HmacMd5_96.truncation_bits(), 96);
        assert_eq!(IntegrityId::HmacSha512_256.kernel_name(), "hmac(sha512)");
        assert_eq!(IntegrityId::from_u16(7), None);
    }

    #[test]
    fn test_key_length_check() {
        assert!(CipherKey::new(CipherId::AesCbc128, vec![0x31; 16])
            .check_len()
            .is_ok());

        let err = CipherKey::new(CipherId::AesCbc128, vec![0x31; 15])
            .check_len()
            .unwrap_err();
        assert_eq!(
            err,
            SaError::BadKeyLength {
                algorithm: "cbc(aes)",
                expected: 16,
                actual: 15
            }
        );

        assert!(IntegrityKey::new(IntegrityId::HmacSha1_96, vec![0; 16])
            .check_len()
            .is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = CipherKey::new(CipherId::AesCbc128, b"super-secret-key".to_vec());
        let debug = format!("{:?}", key);
        assert!(!debug.contains("super"));
        assert!(debug.contains("key_len: 16"));
    }
}
