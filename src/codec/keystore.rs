//! Top-level file format: header, the entry loop, and the trailer
//! digest, tying together [`crate::digest`], [`crate::codec::framed`],
//! and the two key protectors.

use std::io::{Read, Write};

use sha1::{Digest, Sha1};
use tracing::{instrument, trace};

use crate::codec::framed::{ReadExt, WriteExt};
use crate::digest::{DigestReader, DigestWriter};
use crate::error::{KeystoreError, Result};
use crate::javaser;
use crate::store::{
    Entry, KeyStore, KeyStoreOptions, PrivateKeyEntry, SecretKeyEntry, StoreType,
    TrustedCertificateEntry,
};

const MAGIC_JKS: u32 = 0xFEED_FEED;
const MAGIC_JCEKS: u32 = 0xCECE_CECE;
const WRITE_VERSION: u32 = 2;

const TAG_PRIVATE_KEY: u32 = 1;
const TAG_TRUSTED_CERTIFICATE: u32 = 2;
const TAG_SECRET_KEY: u32 = 3;

const MIGHTY_APHRODITE: &[u8] = b"Mighty Aphrodite";

fn password_preamble_hasher(password: &str) -> Sha1 {
    let mut hasher = Sha1::new();
    for unit in password.encode_utf16() {
        hasher.update(unit.to_be_bytes());
    }
    hasher.update(MIGHTY_APHRODITE);
    hasher
}

fn format_error(field: &'static str, cause: impl Into<String>) -> KeystoreError {
    KeystoreError::FormatError {
        field,
        cause: cause.into(),
    }
}

/// Drives the top-level read/write state machine over a [`KeyStore`].
pub struct KeyStoreCodec;

impl KeyStoreCodec {
    /// Reads a full keystore file from `reader`.
    #[instrument(skip(reader, password))]
    pub fn load<R: Read>(reader: R, password: &str) -> Result<KeyStore> {
        let hasher = password_preamble_hasher(password);
        let mut digest_reader = DigestReader::new(reader, hasher);

        let magic = digest_reader.read_u32be()?;
        let store_type = match magic {
            MAGIC_JKS => StoreType::Jks,
            MAGIC_JCEKS => StoreType::Jceks,
            other => {
                return Err(format_error(
                    "magic",
                    format!("unrecognized magic {other:#010x}"),
                ));
            }
        };
        trace!(?store_type, "identified store type from magic");

        let version = digest_reader.read_u32be()?;
        if version != 1 && version != 2 {
            return Err(format_error(
                "version",
                format!("unsupported version {version}"),
            ));
        }

        let count = digest_reader.read_u32be()?;
        let mut store = KeyStore::new(KeyStoreOptions::new().with_store_type(store_type));

        for _ in 0..count {
            let tag = digest_reader.read_u32be()?;
            let alias = digest_reader.read_mod_utf()?;
            let creation_millis = digest_reader.read_u64be()?;

            let entry = match tag {
                TAG_PRIVATE_KEY => {
                    let encrypted_key = digest_reader.read_blob()?;
                    let chain_len = digest_reader.read_u32be()?;
                    let mut certificate_chain = Vec::with_capacity(chain_len as usize);
                    for _ in 0..chain_len {
                        certificate_chain.push(digest_reader.read_certificate(version)?);
                    }
                    Entry::PrivateKey(PrivateKeyEntry {
                        creation_millis,
                        plaintext_key: Vec::new(),
                        encrypted_key,
                        certificate_chain,
                    })
                }
                TAG_TRUSTED_CERTIFICATE => {
                    let certificate = digest_reader.read_certificate(version)?;
                    Entry::TrustedCertificate(TrustedCertificateEntry {
                        creation_millis,
                        certificate,
                    })
                }
                TAG_SECRET_KEY => {
                    if store_type != StoreType::Jceks {
                        return Err(format_error("tag", "secret key entry in a JKS store"));
                    }
                    let sealed_object = javaser::read_raw_object(&mut digest_reader)?;
                    Entry::SecretKey(SecretKeyEntry {
                        creation_millis,
                        sealed_object,
                    })
                }
                other => return Err(format_error("tag", format!("unknown entry tag {other}"))),
            };

            store.insert_loaded(alias, entry);
        }

        // Drain anything left (there shouldn't be any) so the trailer
        // can be captured and verified.
        let mut drain = Vec::new();
        digest_reader.read_to_end(&mut drain)?;
        if !drain.is_empty() {
            return Err(format_error("entries", "trailing bytes before digest"));
        }

        match digest_reader.verify_sign() {
            Some(true) => Ok(store),
            Some(false) => Err(KeystoreError::BadDigest),
            None => Err(KeystoreError::IncompleteRead),
        }
    }

    /// Writes `store` as a full keystore file to `writer`.
    #[instrument(skip(store, writer, password))]
    pub fn store<W: Write>(store: &KeyStore, writer: W, password: &str) -> Result<()> {
        let hasher = password_preamble_hasher(password);
        let mut digest_writer = DigestWriter::new(writer, hasher);

        let magic = match store.store_type() {
            StoreType::Jks => MAGIC_JKS,
            StoreType::Jceks => MAGIC_JCEKS,
        };
        digest_writer.write_u32be(magic)?;
        digest_writer.write_u32be(WRITE_VERSION)?;

        let aliases = store.aliases();
        digest_writer.write_u32be(
            u32::try_from(aliases.len())
                .map_err(|_| format_error("entry count", "more than u32::MAX entries"))?,
        )?;

        for alias in &aliases {
            let entry = store.entries.get(alias).expect("alias came from aliases()");
            match entry {
                Entry::PrivateKey(entry) => {
                    digest_writer.write_u32be(TAG_PRIVATE_KEY)?;
                    digest_writer.write_mod_utf(alias)?;
                    digest_writer.write_u64be(entry.creation_millis)?;
                    digest_writer.write_blob(&entry.encrypted_key)?;
                    digest_writer.write_u32be(
                        u32::try_from(entry.certificate_chain.len())
                            .map_err(|_| format_error("chain length", "chain too long"))?,
                    )?;
                    for cert in &entry.certificate_chain {
                        digest_writer.write_certificate(cert)?;
                    }
                }
                Entry::TrustedCertificate(entry) => {
                    digest_writer.write_u32be(TAG_TRUSTED_CERTIFICATE)?;
                    digest_writer.write_mod_utf(alias)?;
                    digest_writer.write_u64be(entry.creation_millis)?;
                    digest_writer.write_certificate(&entry.certificate)?;
                }
                Entry::SecretKey(entry) => {
                    digest_writer.write_u32be(TAG_SECRET_KEY)?;
                    digest_writer.write_mod_utf(alias)?;
                    digest_writer.write_u64be(entry.creation_millis)?;
                    digest_writer.write_all(&entry.sealed_object)?;
                }
            }
        }

        digest_writer.finish()?;
        Ok(())
    }
}
