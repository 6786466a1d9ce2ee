//! In-memory keystore façade: the alias map and the typed entry
//! accessors applications actually call.

use std::collections::BTreeMap;

use tracing::{debug, instrument};

use crate::codec::keystore::KeyStoreCodec;
use crate::error::{KeystoreError, Result};
use crate::javaser::{KeyRep, SealedObjectForKeyProtector};
use crate::keyprotector::{self, JCE_PRIVATE_KEY_OID, JDK_PRIVATE_KEY_OID};
use crate::pbe::{PbeCipher, PbeParams};
use crate::rand::OsRandomSource;

const MIN_PASSWORD_LEN: usize = 6;

/// Which on-disk flavour a store is (or will be written as).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    Jks,
    Jceks,
}

/// One certificate: its type label (typically `"X.509"`) and DER bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub cert_type: String,
    pub content: Vec<u8>,
}

/// A private key entry. Only one of `plaintext_key`/`encrypted_key` is
/// populated at a time: the store only ever holds the encrypted form,
/// `get_private_key_entry` returns a copy with the plaintext form.
#[derive(Debug, Clone, Default)]
pub struct PrivateKeyEntry {
    pub creation_millis: u64,
    pub plaintext_key: Vec<u8>,
    pub(crate) encrypted_key: Vec<u8>,
    pub certificate_chain: Vec<Certificate>,
}

impl PrivateKeyEntry {
    /// Builds a plaintext entry ready for [`KeyStore::set_private_key_entry`].
    /// The internal encrypted-form field always starts empty; it is
    /// populated by the store on encryption and cleared again on decryption.
    #[must_use]
    pub fn new(
        creation_millis: u64,
        plaintext_key: Vec<u8>,
        certificate_chain: Vec<Certificate>,
    ) -> Self {
        Self {
            creation_millis,
            plaintext_key,
            encrypted_key: Vec::new(),
            certificate_chain,
        }
    }
}

/// A trusted-certificate entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedCertificateEntry {
    pub creation_millis: u64,
    pub certificate: Certificate,
}

/// A JCEKS secret-key entry, as stored (the Java-serialised sealed
/// object, still PBE-encrypted).
#[derive(Debug, Clone)]
pub struct SecretKeyEntry {
    pub creation_millis: u64,
    pub(crate) sealed_object: Vec<u8>,
}

#[derive(Debug, Clone)]
pub(crate) enum Entry {
    PrivateKey(PrivateKeyEntry),
    TrustedCertificate(TrustedCertificateEntry),
    SecretKey(SecretKeyEntry),
}

/// Configuration for a [`KeyStore`], set once at construction.
#[derive(Debug, Clone, Copy)]
pub struct KeyStoreOptions {
    pub(crate) store_type: StoreType,
    pub(crate) ordered_aliases: bool,
    pub(crate) case_exact_aliases: bool,
}

impl Default for KeyStoreOptions {
    fn default() -> Self {
        Self {
            store_type: StoreType::Jks,
            ordered_aliases: false,
            case_exact_aliases: false,
        }
    }
}

impl KeyStoreOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_store_type(mut self, store_type: StoreType) -> Self {
        self.store_type = store_type;
        self
    }

    #[must_use]
    pub fn with_ordered_aliases(mut self) -> Self {
        self.ordered_aliases = true;
        self
    }

    #[must_use]
    pub fn with_case_exact_aliases(mut self) -> Self {
        self.case_exact_aliases = true;
        self
    }
}

/// Normalises an alias for lookup per `case_exact_aliases`.
fn convert_alias(alias: &str, case_exact: bool) -> String {
    if case_exact {
        alias.to_string()
    } else {
        alias.to_lowercase()
    }
}

/// An in-memory JKS/JCEKS keystore: an alias-to-entry map plus the mode
/// flags that govern (de)serialisation.
#[derive(Debug)]
pub struct KeyStore {
    pub(crate) options: KeyStoreOptions,
    pub(crate) entries: BTreeMap<String, Entry>,
    insertion_order: Vec<String>,
}

impl KeyStore {
    /// Creates an empty store with `options`.
    #[must_use]
    pub fn new(options: KeyStoreOptions) -> Self {
        Self {
            options,
            entries: BTreeMap::new(),
            insertion_order: Vec::new(),
        }
    }

    #[must_use]
    pub fn store_type(&self) -> StoreType {
        self.options.store_type
    }

    fn normalize(&self, alias: &str) -> String {
        convert_alias(alias, self.options.case_exact_aliases)
    }

    fn insert(&mut self, alias: String, entry: Entry) {
        if !self.entries.contains_key(&alias) {
            self.insertion_order.push(alias.clone());
        }
        self.entries.insert(alias, entry);
    }

    /// Inserts an entry already read off disk, preserving on-disk order
    /// as insertion order.
    pub(crate) fn insert_loaded(&mut self, alias: String, entry: Entry) {
        self.insert(alias, entry);
    }

    /// Reads and decodes a keystore file from `reader`, verifying its
    /// trailer digest against `password`.
    ///
    /// # Errors
    ///
    /// Errors with `FormatError` on a malformed file, `BadDigest` if the
    /// trailer does not match, or `ShortPassword` if `password` is empty.
    #[instrument(skip(reader, password))]
    pub fn load<R: std::io::Read>(reader: R, password: &str) -> Result<Self> {
        if password.is_empty() {
            return Err(KeystoreError::ShortPassword { min: 1 });
        }
        KeyStoreCodec::load(reader, password)
    }

    /// Encodes and writes the store to `writer`, appending the trailer
    /// digest computed from `password`.
    ///
    /// # Errors
    ///
    /// Errors with `ShortPassword` if `password` is shorter than 6
    /// bytes, or propagates validation errors from malformed entries.
    #[instrument(skip(self, writer, password))]
    pub fn store<W: std::io::Write>(&self, writer: W, password: &str) -> Result<()> {
        if password.len() < MIN_PASSWORD_LEN {
            return Err(KeystoreError::ShortPassword {
                min: MIN_PASSWORD_LEN,
            });
        }
        KeyStoreCodec::store(self, writer, password)
    }

    /// Encrypts `entry`'s plaintext key and stores it under `alias`.
    ///
    /// # Errors
    ///
    /// Errors with `ShortPassword` or `EmptyPrivateKey`.
    pub fn set_private_key_entry(
        &mut self,
        alias: &str,
        mut entry: PrivateKeyEntry,
        password: &str,
    ) -> Result<()> {
        if password.len() < MIN_PASSWORD_LEN {
            return Err(KeystoreError::ShortPassword {
                min: MIN_PASSWORD_LEN,
            });
        }
        if entry.plaintext_key.is_empty() {
            return Err(KeystoreError::EmptyPrivateKey);
        }
        for cert in &entry.certificate_chain {
            if cert.cert_type.is_empty() {
                return Err(KeystoreError::EmptyCertificateType);
            }
            if cert.content.is_empty() {
                return Err(KeystoreError::EmptyCertificateContent);
            }
        }

        let oid: &[u32] = match self.options.store_type {
            StoreType::Jks => &JDK_PRIVATE_KEY_OID,
            StoreType::Jceks => &JCE_PRIVATE_KEY_OID,
        };
        let mut rand = OsRandomSource;
        let envelope =
            keyprotector::encrypt_private_key(&mut rand, oid, password, &entry.plaintext_key)?;

        entry.encrypted_key = envelope.encode();
        entry.plaintext_key.clear();

        self.insert(self.normalize(alias), Entry::PrivateKey(entry));
        Ok(())
    }

    /// Decrypts and returns a copy of the private key entry stored under
    /// `alias`.
    ///
    /// # Errors
    ///
    /// Errors with `EntryNotFound`, `WrongEntryType`, or `BadPassword`.
    #[instrument(skip(self, password))]
    pub fn get_private_key_entry(&self, alias: &str, password: &str) -> Result<PrivateKeyEntry> {
        let alias = self.normalize(alias);
        let entry = match self
            .entries
            .get(&alias)
            .ok_or(KeystoreError::EntryNotFound)?
        {
            Entry::PrivateKey(entry) => entry,
            _ => return Err(KeystoreError::WrongEntryType),
        };

        let envelope = crate::keyprotector::EncryptedPrivateKey::decode(&entry.encrypted_key)?;
        let plaintext = keyprotector::decrypt_private_key(&envelope, password)?;
        debug!(alias, "decrypted private key entry");

        Ok(PrivateKeyEntry {
            creation_millis: entry.creation_millis,
            plaintext_key: plaintext,
            encrypted_key: Vec::new(),
            certificate_chain: entry.certificate_chain.clone(),
        })
    }

    /// Stores `entry` as-is under `alias`.
    ///
    /// # Errors
    ///
    /// Errors with `EmptyCertificateType` / `EmptyCertificateContent`.
    pub fn set_trusted_certificate_entry(
        &mut self,
        alias: &str,
        entry: TrustedCertificateEntry,
    ) -> Result<()> {
        if entry.certificate.cert_type.is_empty() {
            return Err(KeystoreError::EmptyCertificateType);
        }
        if entry.certificate.content.is_empty() {
            return Err(KeystoreError::EmptyCertificateContent);
        }
        self.insert(self.normalize(alias), Entry::TrustedCertificate(entry));
        Ok(())
    }

    /// Returns a copy of the trusted certificate entry stored under
    /// `alias`.
    ///
    /// # Errors
    ///
    /// Errors with `EntryNotFound` / `WrongEntryType`.
    pub fn get_trusted_certificate_entry(&self, alias: &str) -> Result<TrustedCertificateEntry> {
        let alias = self.normalize(alias);
        match self
            .entries
            .get(&alias)
            .ok_or(KeystoreError::EntryNotFound)?
        {
            Entry::TrustedCertificate(entry) => Ok(entry.clone()),
            _ => Err(KeystoreError::WrongEntryType),
        }
    }

    /// Stores a JCEKS secret key, encrypting it as a sealed `KeyRep`.
    ///
    /// # Errors
    ///
    /// Errors with `ShortPassword` or `EmptyPrivateKey` (empty key
    /// bytes).
    pub fn set_secret_key_entry(
        &mut self,
        alias: &str,
        algorithm: &str,
        key_bytes: &[u8],
        password: &str,
    ) -> Result<()> {
        if password.len() < MIN_PASSWORD_LEN {
            return Err(KeystoreError::ShortPassword {
                min: MIN_PASSWORD_LEN,
            });
        }
        if key_bytes.is_empty() {
            return Err(KeystoreError::EmptyPrivateKey);
        }

        let mut rand = OsRandomSource;
        let params = PbeParams::generate(&mut rand, 5000)?;
        let cipher = PbeCipher::new(password.as_bytes(), &params);

        let key_rep = crate::javaser::encode_key_rep(algorithm, "RAW", key_bytes);
        let encrypted_content = cipher.encrypt(&key_rep);
        let sealed_object = crate::javaser::encode_sealed_object(
            &encrypted_content,
            &params.encode(),
            "PBEWithMD5AndTripleDES",
            "PBEWithMD5AndTripleDES",
        );

        self.insert(
            self.normalize(alias),
            Entry::SecretKey(SecretKeyEntry {
                creation_millis: 0,
                sealed_object,
            }),
        );
        Ok(())
    }

    /// Decrypts and returns the raw key bytes for the JCEKS secret key
    /// entry stored under `alias`.
    ///
    /// # Errors
    ///
    /// Errors with `EntryNotFound`, `WrongEntryType`, `BadPassword`, or
    /// `MalformedSealedObject`.
    #[instrument(skip(self, password))]
    pub fn get_secret_key_entry(&self, alias: &str, password: &str) -> Result<Vec<u8>> {
        let alias = self.normalize(alias);
        let entry = match self
            .entries
            .get(&alias)
            .ok_or(KeystoreError::EntryNotFound)?
        {
            Entry::SecretKey(entry) => entry,
            _ => return Err(KeystoreError::WrongEntryType),
        };

        let sealed = SealedObjectForKeyProtector::decode(&entry.sealed_object)?;
        let params = PbeParams::decode(&sealed.encoded_params)?;
        let cipher = PbeCipher::new(password.as_bytes(), &params);
        let plaintext = cipher.decrypt(&sealed.encrypted_content)?;

        let key_rep = KeyRep::decode(&plaintext)?;
        Ok(key_rep.encoded)
    }

    /// Removes the entry stored under `alias`, if any.
    pub fn delete_entry(&mut self, alias: &str) {
        let alias = self.normalize(alias);
        self.entries.remove(&alias);
        self.insertion_order.retain(|a| a != &alias);
    }

    /// Lists all aliases, ordered per `with_ordered_aliases`.
    #[must_use]
    pub fn aliases(&self) -> Vec<String> {
        if self.options.ordered_aliases {
            self.entries.keys().cloned().collect()
        } else {
            self.insertion_order.clone()
        }
    }

    #[must_use]
    pub fn is_private_key_entry(&self, alias: &str) -> bool {
        matches!(
            self.entries.get(&self.normalize(alias)),
            Some(Entry::PrivateKey(_))
        )
    }

    #[must_use]
    pub fn is_trusted_certificate_entry(&self, alias: &str) -> bool {
        matches!(
            self.entries.get(&self.normalize(alias)),
            Some(Entry::TrustedCertificate(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_folding_normalizes_by_default() {
        let mut store = KeyStore::new(KeyStoreOptions::new());
        store
            .set_trusted_certificate_entry(
                "A",
                TrustedCertificateEntry {
                    creation_millis: 0,
                    certificate: Certificate {
                        cert_type: "X.509".to_string(),
                        content: vec![1, 2, 3],
                    },
                },
            )
            .unwrap();

        assert!(store.get_trusted_certificate_entry("a").is_ok());
        assert_eq!(store.aliases(), vec!["a"]);
    }

    #[test]
    fn case_exact_preserves_alias() {
        let mut store = KeyStore::new(KeyStoreOptions::new().with_case_exact_aliases());
        store
            .set_trusted_certificate_entry(
                "A",
                TrustedCertificateEntry {
                    creation_millis: 0,
                    certificate: Certificate {
                        cert_type: "X.509".to_string(),
                        content: vec![1],
                    },
                },
            )
            .unwrap();

        assert!(store.get_trusted_certificate_entry("a").is_err());
        assert!(store.get_trusted_certificate_entry("A").is_ok());
    }

    #[test]
    fn ordered_aliases_are_sorted() {
        let mut store = KeyStore::new(KeyStoreOptions::new().with_ordered_aliases());
        for alias in ["zebra", "apple", "mango"] {
            store
                .set_trusted_certificate_entry(
                    alias,
                    TrustedCertificateEntry {
                        creation_millis: 0,
                        certificate: Certificate {
                            cert_type: "X.509".to_string(),
                            content: vec![1],
                        },
                    },
                )
                .unwrap();
        }
        assert_eq!(store.aliases(), vec!["apple", "mango", "zebra"]);
    }

    #[test]
    fn private_key_roundtrips_through_get() {
        let mut store = KeyStore::new(KeyStoreOptions::new());
        store
            .set_private_key_entry(
                "server",
                PrivateKeyEntry {
                    creation_millis: 1000,
                    plaintext_key: b"my secret key".to_vec(),
                    encrypted_key: Vec::new(),
                    certificate_chain: vec![Certificate {
                        cert_type: "X.509".to_string(),
                        content: vec![9, 9, 9],
                    }],
                },
                "hunter22",
            )
            .unwrap();

        let entry = store.get_private_key_entry("server", "hunter22").unwrap();
        assert_eq!(entry.plaintext_key, b"my secret key");
        assert_eq!(entry.certificate_chain.len(), 1);

        let err = store
            .get_private_key_entry("server", "wrong password")
            .unwrap_err();
        assert!(matches!(err, KeystoreError::BadPassword));
    }

    #[test]
    fn wrong_entry_type_is_rejected() {
        let mut store = KeyStore::new(KeyStoreOptions::new());
        store
            .set_trusted_certificate_entry(
                "ca",
                TrustedCertificateEntry {
                    creation_millis: 0,
                    certificate: Certificate {
                        cert_type: "X.509".to_string(),
                        content: vec![1],
                    },
                },
            )
            .unwrap();

        let err = store
            .get_private_key_entry("ca", "password123")
            .unwrap_err();
        assert!(matches!(err, KeystoreError::WrongEntryType));
    }

    #[test]
    fn short_password_is_rejected_on_write() {
        let mut store = KeyStore::new(KeyStoreOptions::new());
        let err = store
            .set_private_key_entry(
                "x",
                PrivateKeyEntry {
                    creation_millis: 0,
                    plaintext_key: b"k".to_vec(),
                    encrypted_key: Vec::new(),
                    certificate_chain: Vec::new(),
                },
                "short",
            )
            .unwrap_err();
        assert!(matches!(err, KeystoreError::ShortPassword { min: 6 }));
    }

    #[test]
    fn secret_key_entry_roundtrips() {
        let mut store = KeyStore::new(KeyStoreOptions::new().with_store_type(StoreType::Jceks));
        store
            .set_secret_key_entry("aes-key", "AES", b"0123456789abcdef", "hunter22")
            .unwrap();

        let key = store.get_secret_key_entry("aes-key", "hunter22").unwrap();
        assert_eq!(key, b"0123456789abcdef");
    }

    #[test]
    fn delete_entry_removes_alias() {
        let mut store = KeyStore::new(KeyStoreOptions::new());
        store
            .set_trusted_certificate_entry(
                "ca",
                TrustedCertificateEntry {
                    creation_millis: 0,
                    certificate: Certificate {
                        cert_type: "X.509".to_string(),
                        content: vec![1],
                    },
                },
            )
            .unwrap();
        store.delete_entry("ca");
        assert!(store.aliases().is_empty());
        assert!(store.get_trusted_certificate_entry("ca").is_err());
    }
}
