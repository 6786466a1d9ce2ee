//! Length-prefixed primitives shared by every entry in a keystore file:
//! big-endian integers, Java's "modified UTF-8" strings, and
//! length-prefixed byte/certificate blobs.

use std::io::{Read, Write};

use crate::error::{KeystoreError, Result};
use crate::store::Certificate;

/// Encodes a string the way `java.io.DataOutputStream.writeUTF` does:
/// each UTF-16 code unit is re-encoded so that `\0` never appears as a
/// single `0x00` byte and supplementary code points travel as a pair of
/// 3-byte-encoded surrogates (CESU-8) rather than a single 4-byte
/// sequence.
#[must_use]
pub fn encode_mod_utf(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for unit in s.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) as u8 & 0x1F));
                out.push(0x80 | (unit as u8 & 0x3F));
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) as u8 & 0x0F));
                out.push(0x80 | ((unit >> 6) as u8 & 0x3F));
                out.push(0x80 | (unit as u8 & 0x3F));
            }
        }
    }
    out
}

/// Decodes bytes produced by [`encode_mod_utf`] back into a `String`.
///
/// # Errors
///
/// Errors with `FormatError` if the byte sequence is not valid modified
/// UTF-8, or if the resulting UTF-16 code units do not form valid text.
pub fn decode_mod_utf(bytes: &[u8]) -> Result<String> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b0 = bytes[i];
        if b0 & 0x80 == 0 {
            units.push(u16::from(b0));
            i += 1;
        } else if b0 & 0xE0 == 0xC0 {
            let b1 = *byte_at(bytes, i + 1)?;
            units.push((u16::from(b0 & 0x1F) << 6) | u16::from(b1 & 0x3F));
            i += 2;
        } else if b0 & 0xF0 == 0xE0 {
            let b1 = *byte_at(bytes, i + 1)?;
            let b2 = *byte_at(bytes, i + 2)?;
            units.push(
                (u16::from(b0 & 0x0F) << 12) | (u16::from(b1 & 0x3F) << 6) | u16::from(b2 & 0x3F),
            );
            i += 3;
        } else {
            return Err(format_error("modified-utf8", "invalid leading byte"));
        }
    }
    String::from_utf16(&units).map_err(|e| format_error("modified-utf8", &e.to_string()))
}

fn byte_at(bytes: &[u8], i: usize) -> Result<&u8> {
    bytes
        .get(i)
        .ok_or_else(|| format_error("modified-utf8", "truncated multi-byte sequence"))
}

fn format_error(field: &'static str, cause: &str) -> KeystoreError {
    KeystoreError::FormatError {
        field,
        cause: cause.to_string(),
    }
}

/// Read-side framing primitives, implemented for any [`Read`].
pub trait ReadExt: Read {
    /// Reads a big-endian `u32`.
    fn read_u32be(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)
            .map_err(|e| io_format_error("u32", e))?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Reads a big-endian `u64`.
    fn read_u64be(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)
            .map_err(|e| io_format_error("u64", e))?;
        Ok(u64::from_be_bytes(buf))
    }

    /// Reads a `u16`-length-prefixed modified-UTF-8 string.
    fn read_mod_utf(&mut self) -> Result<String> {
        let mut len_buf = [0u8; 2];
        self.read_exact(&mut len_buf)
            .map_err(|e| io_format_error("string length", e))?;
        let len = u16::from_be_bytes(len_buf) as usize;

        let mut bytes = vec![0u8; len];
        self.read_exact(&mut bytes)
            .map_err(|e| io_format_error("string body", e))?;
        decode_mod_utf(&bytes)
    }

    /// Reads a `u32`-length-prefixed byte blob.
    fn read_blob(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32be()? as usize;
        let mut bytes = vec![0u8; len];
        self.read_exact(&mut bytes)
            .map_err(|e| io_format_error("blob body", e))?;
        Ok(bytes)
    }

    /// Reads a certificate. Version 1 files omit the type and imply
    /// `"X.509"`; version 2 files prefix the type as modified UTF-8.
    fn read_certificate(&mut self, version: u32) -> Result<Certificate> {
        let cert_type = if version == 1 {
            "X.509".to_string()
        } else {
            self.read_mod_utf()?
        };
        let content = self.read_blob()?;
        Ok(Certificate { cert_type, content })
    }
}

impl<R: Read + ?Sized> ReadExt for R {}

fn io_format_error(field: &'static str, e: std::io::Error) -> KeystoreError {
    KeystoreError::FormatError {
        field,
        cause: e.to_string(),
    }
}

/// Write-side framing primitives, implemented for any [`Write`].
pub trait WriteExt: Write {
    /// Writes a big-endian `u32`.
    fn write_u32be(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    /// Writes a big-endian `u64`.
    fn write_u64be(&mut self, v: u64) -> Result<()> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    /// Writes a `u16`-length-prefixed modified-UTF-8 string.
    fn write_mod_utf(&mut self, s: &str) -> Result<()> {
        let bytes = encode_mod_utf(s);
        let len = u16::try_from(bytes.len()).map_err(|_| KeystoreError::FormatError {
            field: "string length",
            cause: "encoded string longer than 65535 bytes".to_string(),
        })?;
        self.write_all(&len.to_be_bytes())?;
        self.write_all(&bytes)?;
        Ok(())
    }

    /// Writes a `u32`-length-prefixed byte blob.
    fn write_blob(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_u32be(
            u32::try_from(bytes.len()).map_err(|_| KeystoreError::FormatError {
                field: "blob length",
                cause: "blob longer than u32::MAX bytes".to_string(),
            })?,
        )?;
        self.write_all(bytes)?;
        Ok(())
    }

    /// Writes a certificate. Always emits the version-2 shape (type
    /// prefix present).
    fn write_certificate(&mut self, cert: &Certificate) -> Result<()> {
        self.write_mod_utf(&cert.cert_type)?;
        self.write_blob(&cert.content)?;
        Ok(())
    }
}

impl<W: Write + ?Sized> WriteExt for W {}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn mod_utf_round_trips_ascii() {
        let encoded = encode_mod_utf("hello");
        assert_eq!(decode_mod_utf(&encoded).unwrap(), "hello");
    }

    #[test]
    fn mod_utf_encodes_nul_as_two_bytes() {
        let encoded = encode_mod_utf("\0");
        assert_eq!(encoded, vec![0xC0, 0x80]);
        assert_eq!(decode_mod_utf(&encoded).unwrap(), "\0");
    }

    #[test]
    fn mod_utf_round_trips_supplementary_code_point() {
        let s = "\u{1F600}"; // outside the BMP, needs a surrogate pair
        let encoded = encode_mod_utf(s);
        // Each surrogate half is individually 3-byte encoded: 6 bytes total.
        assert_eq!(encoded.len(), 6);
        assert_eq!(decode_mod_utf(&encoded).unwrap(), s);
    }

    #[test]
    fn u32_and_u64_round_trip() {
        let mut buf = Vec::new();
        buf.write_u32be(0xDEAD_BEEF).unwrap();
        buf.write_u64be(0x0102_0304_0506_0708).unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(cursor.read_u32be().unwrap(), 0xDEAD_BEEF);
        assert_eq!(cursor.read_u64be().unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn blob_round_trips() {
        let mut buf = Vec::new();
        buf.write_blob(b"hello").unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(cursor.read_blob().unwrap(), b"hello");
    }

    #[test]
    fn certificate_round_trips_version_2() {
        let cert = Certificate {
            cert_type: "X.509".to_string(),
            content: vec![1, 2, 3],
        };
        let mut buf = Vec::new();
        buf.write_certificate(&cert).unwrap();

        let mut cursor = Cursor::new(buf);
        let read_back = cursor.read_certificate(2).unwrap();
        assert_eq!(read_back, cert);
    }

    #[test]
    fn certificate_version_1_has_no_type_prefix() {
        let mut buf = Vec::new();
        buf.write_blob(&[1, 2, 3]).unwrap();

        let mut cursor = Cursor::new(buf);
        let read_back = cursor.read_certificate(1).unwrap();
        assert_eq!(read_back.cert_type, "X.509");
        assert_eq!(read_back.content, vec![1, 2, 3]);
    }
}
