//! "PBEWithMD5AndTripleDES" — the undocumented password-based cipher JCEKS
//! uses to protect private and secret keys. Key derivation (§ key
//! derivation) and the block cipher (3DES-CBC, PKCS#5 padding) are kept
//! here; the ASN.1 envelope that carries the algorithm OID lives in
//! [`crate::keyprotector`].

use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockModeDecrypt, BlockModeEncrypt, KeyIvInit};
use des::TdesEde3;
use md5::{Digest, Md5};

use crate::der::{self, TAG_INTEGER, TAG_OCTET_STRING, TAG_SEQUENCE};
use crate::error::{KeystoreError, Result};
use crate::rand::RandomSource;

type TdesCbcEnc = cbc::Encryptor<TdesEde3>;
type TdesCbcDec = cbc::Decryptor<TdesEde3>;

const SALT_LEN: usize = 8;
const BLOCK_SIZE: usize = 8;

/// `SEQUENCE { OCTET STRING salt, INTEGER iterations }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbeParams {
    pub salt: [u8; SALT_LEN],
    pub iterations: u32,
}

impl PbeParams {
    /// Generates fresh parameters with a random salt.
    ///
    /// # Errors
    ///
    /// Errors if `rand` fails to produce random bytes.
    pub fn generate(rand: &mut dyn RandomSource, iterations: u32) -> Result<Self> {
        let mut salt = [0u8; SALT_LEN];
        rand.fill(&mut salt)?;
        Ok(Self { salt, iterations })
    }

    /// Encodes as DER `SEQUENCE { OCTET STRING, INTEGER }`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let content = [
            der::encode_tlv(TAG_OCTET_STRING, &self.salt),
            der::encode_tlv(TAG_INTEGER, &der::encode_integer(self.iterations)),
        ]
        .concat();
        der::encode_tlv(TAG_SEQUENCE, &content)
    }

    /// Decodes from DER.
    ///
    /// # Errors
    ///
    /// Errors with `FormatError` if `bytes` is not a well-formed
    /// `PBEParameter` sequence.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (seq, trailing) = der::parse_tlv(bytes)?;
        expect_empty(trailing, "pbe params")?;
        expect_tag(seq.tag, TAG_SEQUENCE, "pbe params")?;

        let (salt_tlv, rest) = der::parse_tlv(seq.content)?;
        expect_tag(salt_tlv.tag, TAG_OCTET_STRING, "pbe salt")?;
        let (iter_tlv, rest) = der::parse_tlv(rest)?;
        expect_tag(iter_tlv.tag, TAG_INTEGER, "pbe iterations")?;
        expect_empty(rest, "pbe params")?;

        let salt: [u8; SALT_LEN] =
            salt_tlv
                .content
                .try_into()
                .map_err(|_| KeystoreError::FormatError {
                    field: "pbe salt",
                    cause: format!("expected {SALT_LEN} bytes", SALT_LEN = SALT_LEN),
                })?;
        let iterations = der::decode_integer(iter_tlv.content)?;

        Ok(Self { salt, iterations })
    }
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

/// Splits `salt` into two 4-byte halves, reversing the first half if the
/// two halves are identical (see the design note on this open question).
fn salt_halves(salt: &[u8; SALT_LEN]) -> ([u8; 4], [u8; 4]) {
    let mut s0: [u8; 4] = salt[..4].try_into().expect("4-byte slice");
    let s1: [u8; 4] = salt[4..].try_into().expect("4-byte slice");
    if s0 == s1 {
        s0.reverse();
    }
    (s0, s1)
}

fn iterate_md5(half: [u8; 4], password: &[u8], iterations: u32) -> [u8; 16] {
    let mut digest = half.to_vec();
    for _ in 0..iterations {
        let mut hasher = Md5::new();
        hasher.update(&digest);
        hasher.update(password);
        digest = hasher.finalize().to_vec();
    }
    digest.try_into().expect("md5 digest is 16 bytes")
}

/// Derives the 24-byte triple-DES key and 8-byte IV from `password` and
/// `salt`/`iterations`.
#[must_use]
pub fn derive_key_iv(
    password: &[u8],
    salt: &[u8; SALT_LEN],
    iterations: u32,
) -> ([u8; 24], [u8; 8]) {
    let (s0, s1) = salt_halves(salt);
    let d0 = iterate_md5(s0, password, iterations);
    let d1 = iterate_md5(s1, password, iterations);

    let mut key = [0u8; 24];
    key[..16].copy_from_slice(&d0);
    key[16..].copy_from_slice(&d1[..8]);

    let mut iv = [0u8; 8];
    iv.copy_from_slice(&d1[8..]);

    (key, iv)
}

fn pkcs5_pad(data: &[u8]) -> Vec<u8> {
    let pad_len = BLOCK_SIZE - (data.len() % BLOCK_SIZE);
    let mut out = data.to_vec();
    out.extend(std::iter::repeat_n(pad_len as u8, pad_len));
    out
}

fn pkcs5_unpad(mut data: Vec<u8>) -> Vec<u8> {
    if let Some(&last) = data.last() {
        let pad_len = last as usize;
        if pad_len > 0 && pad_len <= data.len() {
            data.truncate(data.len() - pad_len);
        }
    }
    data
}

/// 3DES-CBC encrypt/decrypt under a key+IV derived from a password.
pub struct PbeCipher {
    key: [u8; 24],
    iv: [u8; 8],
}

impl PbeCipher {
    /// Derives a cipher from `password` and `params`.
    ///
    /// `password` is the password's raw byte representation (what the
    /// JCE provider calls ASCII/Latin-1 encoding), not the UTF-16BE form
    /// used by the JKS digest trailer and key protector — this is a real
    /// distinction in the reference implementation, not an oversight.
    #[must_use]
    pub fn new(password: &[u8], params: &PbeParams) -> Self {
        let (key, iv) = derive_key_iv(password, &params.salt, params.iterations);
        Self { key, iv }
    }

    /// Encrypts `plaintext`, padding it to a multiple of the block size.
    #[must_use]
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let padded = pkcs5_pad(plaintext);
        TdesCbcEnc::new_from_slices(&self.key, &self.iv)
            .expect("key/iv sizes are fixed and correct")
            .encrypt_padded_vec::<NoPadding>(&padded)
    }

    /// Decrypts `ciphertext` and strips the PKCS#5 pad without validating
    /// the pad byte values beyond the trailing length byte, matching the
    /// reference implementation.
    ///
    /// # Errors
    ///
    /// Errors with `FormatError` if `ciphertext` is not a multiple of the
    /// block size.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let decrypted = TdesCbcDec::new_from_slices(&self.key, &self.iv)
            .expect("key/iv sizes are fixed and correct")
            .decrypt_padded_vec::<NoPadding>(ciphertext)
            .map_err(|_| KeystoreError::FormatError {
                field: "pbe ciphertext",
                cause: "not a multiple of the block size".to_string(),
            })?;
        Ok(pkcs5_unpad(decrypted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rand::FixedRandomSource;

    #[test]
    fn scenario_c_pbe_kdf_vector() {
        let salt: [u8; 8] = [0x69, 0xEA, 0xFF, 0x28, 0x65, 0x85, 0x0A, 0x68];
        let (key, iv) = derive_key_iv(b"mypassword", &salt, 2000);

        assert_eq!(
            key,
            [
                0x8C, 0xE5, 0x38, 0xD7, 0x99, 0xF2, 0x39, 0xE7, 0x70, 0x03, 0x4B, 0xE6, 0xBF, 0xD3,
                0x81, 0x94, 0x2F, 0xA3, 0xEE, 0xCD, 0x18, 0xBF, 0xA7, 0xCB,
            ]
        );
        assert_eq!(iv, [0x36, 0x91, 0x08, 0x2B, 0xF4, 0x99, 0x2E, 0x92]);
    }

    #[test]
    fn scenario_d_pbe_roundtrip() {
        let params = PbeParams {
            salt: [1, 2, 3, 4, 5, 6, 7, 8],
            iterations: 2000,
        };
        let cipher = PbeCipher::new(b"my_password", &params);

        let ciphertext = cipher.encrypt(b"my_secret");
        assert_eq!(
            ciphertext,
            vec![
                0x91, 0x10, 0x29, 0xF1, 0x2B, 0x07, 0x73, 0x9F, 0x98, 0x0A, 0x25, 0x70, 0x5F, 0x00,
                0xB9, 0xC7,
            ]
        );

        let plaintext = cipher.decrypt(&ciphertext).unwrap();
        assert_eq!(plaintext, b"my_secret");
    }

    #[test]
    fn scenario_e_pbe_param_der() {
        let params = PbeParams {
            salt: [1, 2, 3, 4, 5, 6, 7, 8],
            iterations: 2000,
        };
        let encoded = params.encode();
        assert_eq!(
            encoded,
            vec![
                0x30, 0x0E, 0x04, 0x08, 1, 2, 3, 4, 5, 6, 7, 8, 0x02, 0x02, 0x07, 0xD0
            ]
        );

        let decoded = PbeParams::decode(&encoded).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn generate_uses_random_source() {
        let mut rand = FixedRandomSource(vec![9, 8, 7, 6, 5, 4, 3, 2]);
        let params = PbeParams::generate(&mut rand, 5000).unwrap();
        assert_eq!(params.salt, [9, 8, 7, 6, 5, 4, 3, 2]);
        assert_eq!(params.iterations, 5000);
    }

    /// Pins the behaviour chosen for the "invert half" open question: when
    /// both 4-byte salt halves are identical, the first half is
    /// byte-reversed before the MD5 rounds rather than bit-complemented.
    #[test]
    fn invert_half_branch_reverses_identical_halves() {
        let salt: [u8; 8] = [0x11, 0x22, 0x33, 0x44, 0x11, 0x22, 0x33, 0x44];
        let (s0, s1) = salt_halves(&salt);
        assert_eq!(s0, [0x44, 0x33, 0x22, 0x11]);
        assert_eq!(s1, [0x11, 0x22, 0x33, 0x44]);
    }
}
