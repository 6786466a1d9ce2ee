//! Private-key protection: the outer ASN.1 envelope shared by both
//! algorithms, the JDK's proprietary SHA-1-XOR-stream cipher (JKS), and
//! dispatch into [`crate::pbe`] for the JCEKS algorithm.

use secrecy::{ExposeSecret, SecretSlice};
use sha1::{Digest, Sha1};

use crate::der::{self, TAG_NULL, TAG_OCTET_STRING, TAG_OID, TAG_SEQUENCE};
use crate::error::{KeystoreError, Result};
use crate::pbe::{PbeCipher, PbeParams};
use crate::rand::RandomSource;

/// `1.3.6.1.4.1.42.2.17.1.1` — the JDK's own undocumented key-protection
/// algorithm, used by JKS.
pub const JDK_PRIVATE_KEY_OID: [u32; 11] = [1, 3, 6, 1, 4, 1, 42, 2, 17, 1, 1];
/// `1.3.6.1.4.1.42.2.19.1` — "PBEWithMD5AndTripleDES", used by JCEKS.
pub const JCE_PRIVATE_KEY_OID: [u32; 10] = [1, 3, 6, 1, 4, 1, 42, 2, 19, 1];

const JKS_SALT_LEN: usize = 20;
const SHA1_LEN: usize = 20;

/// Expands a password into its big-endian UTF-16 byte form, zeroized on
/// drop. This is the JDK-proprietary convention used by the digest
/// trailer and this key protector — JCEKS's PBE cipher uses the raw
/// password bytes instead, see [`crate::pbe`].
pub(crate) fn utf16be_password(password: &str) -> SecretSlice<u8> {
    let mut bytes = Vec::with_capacity(password.len() * 2);
    for unit in password.encode_utf16() {
        bytes.extend_from_slice(&unit.to_be_bytes());
    }
    SecretSlice::from(bytes)
}

/// A decoded `EncryptedPrivateKey` envelope: `SEQUENCE { algorithm
/// AlgorithmIdentifier, encryptedData OCTET STRING }`.
pub struct EncryptedPrivateKey {
    pub oid: Vec<u32>,
    /// Raw bytes of the algorithm's `parameters` TLV (its tag, length,
    /// and content) — a DER `NULL` for JKS, the encoded [`PbeParams`]
    /// sequence for JCEKS.
    pub params: Vec<u8>,
    pub encrypted_key: Vec<u8>,
}

fn expect_tag(got: u8, want: u8, field: &'static str) -> Result<()> {
    if got == want {
        Ok(())
    } else {
        Err(KeystoreError::FormatError {
            field,
            cause: format!("unexpected DER tag {got:#04x}, wanted {want:#04x}"),
        })
    }
}

fn expect_empty(bytes: &[u8], field: &'static str) -> Result<()> {
    if bytes.is_empty() {
        Ok(())
    } else {
        Err(KeystoreError::FormatError {
            field,
            cause: "unexpected trailing DER bytes".to_string(),
        })
    }
}

impl EncryptedPrivateKey {
    /// Encodes the envelope.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let oid_tlv = der::encode_tlv(TAG_OID, &der::encode_oid(&self.oid));
        let algorithm = der::encode_tlv(TAG_SEQUENCE, &[oid_tlv, self.params.clone()].concat());
        let content = [
            algorithm,
            der::encode_tlv(TAG_OCTET_STRING, &self.encrypted_key),
        ]
        .concat();
        der::encode_tlv(TAG_SEQUENCE, &content)
    }

    /// Decodes the envelope.
    ///
    /// # Errors
    ///
    /// Errors with `FormatError` if `bytes` is not a well-formed
    /// `EncryptedPrivateKey` sequence.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (outer, trailing) = der::parse_tlv(bytes)?;
        expect_empty(trailing, "encrypted private key")?;
        expect_tag(outer.tag, TAG_SEQUENCE, "encrypted private key")?;

        let (algorithm, rest) = der::parse_tlv(outer.content)?;
        expect_tag(algorithm.tag, TAG_SEQUENCE, "algorithm identifier")?;
        let (key_tlv, rest) = der::parse_tlv(rest)?;
        expect_tag(key_tlv.tag, TAG_OCTET_STRING, "encrypted key")?;
        expect_empty(rest, "encrypted private key")?;

        let (oid_tlv, params) = der::parse_tlv(algorithm.content)?;
        expect_tag(oid_tlv.tag, TAG_OID, "algorithm oid")?;
        let oid = der::decode_oid(oid_tlv.content)?;

        Ok(Self {
            oid,
            params: params.to_vec(),
            encrypted_key: key_tlv.content.to_vec(),
        })
    }
}

/// Builds the SHA-1 keystream `W_1 || W_2 || …` where `W_1 =
/// SHA1(password || seed)` and `W_{i+1} = SHA1(password || W_i)`,
/// truncated to `len` bytes.
fn xor_keystream(password: &[u8], seed: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + SHA1_LEN);
    let mut digest = seed.to_vec();
    while out.len() < len {
        let mut hasher = Sha1::new();
        hasher.update(password);
        hasher.update(&digest);
        digest = hasher.finalize().to_vec();
        out.extend_from_slice(&digest);
    }
    out.truncate(len);
    out
}

/// Decrypts a JKS-protected private key.
///
/// # Errors
///
/// Errors with `FormatError` if `encrypted_key` is too short to contain
/// a salt and checksum, or `BadPassword` if the checksum does not match.
pub fn jks_decrypt(password: &str, encrypted_key: &[u8]) -> Result<Vec<u8>> {
    if encrypted_key.len() < JKS_SALT_LEN + SHA1_LEN {
        return Err(KeystoreError::FormatError {
            field: "jks encrypted key",
            cause: "too short to contain salt and checksum".to_string(),
        });
    }

    let salt = &encrypted_key[..JKS_SALT_LEN];
    let checksum = &encrypted_key[encrypted_key.len() - SHA1_LEN..];
    let ciphertext = &encrypted_key[JKS_SALT_LEN..encrypted_key.len() - SHA1_LEN];

    let pw = utf16be_password(password);
    let pw = pw.expose_secret();

    let xor_key = xor_keystream(pw, salt, ciphertext.len());
    let plain: Vec<u8> = ciphertext
        .iter()
        .zip(xor_key.iter())
        .map(|(c, k)| c ^ k)
        .collect();

    let mut hasher = Sha1::new();
    hasher.update(pw);
    hasher.update(&plain);
    let computed = hasher.finalize();

    if computed.as_slice() != checksum {
        return Err(KeystoreError::BadPassword);
    }

    Ok(plain)
}

/// Encrypts a private key under the JKS proprietary algorithm.
///
/// # Errors
///
/// Errors if `rand` fails to produce a salt.
pub fn jks_encrypt(
    rand: &mut dyn RandomSource,
    password: &str,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let mut salt = [0u8; JKS_SALT_LEN];
    rand.fill(&mut salt)?;

    let pw = utf16be_password(password);
    let pw = pw.expose_secret();

    let xor_key = xor_keystream(pw, &salt, plaintext.len());
    let xored: Vec<u8> = plaintext
        .iter()
        .zip(xor_key.iter())
        .map(|(p, k)| p ^ k)
        .collect();

    let mut hasher = Sha1::new();
    hasher.update(pw);
    hasher.update(plaintext);
    let checksum = hasher.finalize();

    let mut out = Vec::with_capacity(JKS_SALT_LEN + xored.len() + SHA1_LEN);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&xored);
    out.extend_from_slice(&checksum);
    Ok(out)
}

/// Decrypts a private key, dispatching on the algorithm OID carried in
/// `envelope`.
///
/// # Errors
///
/// Errors with `UnsupportedAlgorithm` for any OID other than the JKS or
/// JCEKS private-key algorithms, or propagates `BadPassword` /
/// `FormatError` from the underlying cipher.
pub fn decrypt_private_key(envelope: &EncryptedPrivateKey, password: &str) -> Result<Vec<u8>> {
    if envelope.oid == JDK_PRIVATE_KEY_OID {
        jks_decrypt(password, &envelope.encrypted_key)
    } else if envelope.oid == JCE_PRIVATE_KEY_OID {
        let (params_tlv, rest) = der::parse_tlv(&envelope.params)?;
        expect_empty(rest, "pbe algorithm parameters")?;
        let params = PbeParams::decode(&der::encode_tlv(params_tlv.tag, params_tlv.content))?;
        let cipher = PbeCipher::new(password.as_bytes(), &params);
        cipher.decrypt(&envelope.encrypted_key)
    } else {
        Err(KeystoreError::UnsupportedAlgorithm {
            oid: format!("{:?}", envelope.oid),
        })
    }
}

/// Encrypts `plaintext` under the algorithm selected by `oid`, one of
/// [`JDK_PRIVATE_KEY_OID`] or [`JCE_PRIVATE_KEY_OID`].
///
/// # Errors
///
/// Errors with `UnsupportedAlgorithm` for any other OID, or if `rand`
/// fails.
pub fn encrypt_private_key(
    rand: &mut dyn RandomSource,
    oid: &[u32],
    password: &str,
    plaintext: &[u8],
) -> Result<EncryptedPrivateKey> {
    if oid == JDK_PRIVATE_KEY_OID {
        let encrypted_key = jks_encrypt(rand, password, plaintext)?;
        Ok(EncryptedPrivateKey {
            oid: oid.to_vec(),
            params: der::encode_tlv(TAG_NULL, &[]),
            encrypted_key,
        })
    } else if oid == JCE_PRIVATE_KEY_OID {
        let params = PbeParams::generate(rand, 5000)?;
        let cipher = PbeCipher::new(password.as_bytes(), &params);
        let encrypted_key = cipher.encrypt(plaintext);
        Ok(EncryptedPrivateKey {
            oid: oid.to_vec(),
            params: params.encode(),
            encrypted_key,
        })
    } else {
        Err(KeystoreError::UnsupportedAlgorithm {
            oid: format!("{oid:?}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rand::FixedRandomSource;

    #[test]
    fn jks_roundtrip() {
        let mut rand = FixedRandomSource(vec![7u8; 64]);
        let envelope = encrypt_private_key(
            &mut rand,
            &JDK_PRIVATE_KEY_OID,
            "hunter2",
            b"super secret key",
        )
        .unwrap();

        let plaintext = decrypt_private_key(&envelope, "hunter2").unwrap();
        assert_eq!(plaintext, b"super secret key");
    }

    #[test]
    fn jks_wrong_password_is_rejected() {
        let mut rand = FixedRandomSource(vec![7u8; 64]);
        let envelope = encrypt_private_key(
            &mut rand,
            &JDK_PRIVATE_KEY_OID,
            "hunter2",
            b"super secret key",
        )
        .unwrap();

        let err = decrypt_private_key(&envelope, "wrong password").unwrap_err();
        assert!(matches!(err, KeystoreError::BadPassword));
    }

    #[test]
    fn jceks_roundtrip() {
        let mut rand = FixedRandomSource(vec![3u8; 64]);
        let envelope = encrypt_private_key(
            &mut rand,
            &JCE_PRIVATE_KEY_OID,
            "hunter2",
            b"another secret",
        )
        .unwrap();

        let plaintext = decrypt_private_key(&envelope, "hunter2").unwrap();
        assert_eq!(plaintext, b"another secret");
    }

    #[test]
    fn unsupported_oid_is_rejected() {
        let envelope = EncryptedPrivateKey {
            oid: vec![1, 2, 3],
            params: der::encode_tlv(TAG_NULL, &[]),
            encrypted_key: vec![0; 40],
        };
        let err = decrypt_private_key(&envelope, "hunter2").unwrap_err();
        assert!(matches!(err, KeystoreError::UnsupportedAlgorithm { .. }));
    }

    #[test]
    fn envelope_round_trips_through_der() {
        let envelope = EncryptedPrivateKey {
            oid: JDK_PRIVATE_KEY_OID.to_vec(),
            params: der::encode_tlv(TAG_NULL, &[]),
            encrypted_key: vec![1, 2, 3, 4],
        };
        let encoded = envelope.encode();
        let decoded = EncryptedPrivateKey::decode(&encoded).unwrap();
        assert_eq!(decoded.oid, envelope.oid);
        assert_eq!(decoded.encrypted_key, envelope.encrypted_key);
    }
}
