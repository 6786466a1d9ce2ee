//! Tail-trailer streaming integrity reader/writer.
//!
//! The keystore file format appends its own integrity digest to the end of
//! the byte stream it protects. A naive reader cannot tell "this is
//! protected data" from "this is the digest" without knowing where the
//! stream ends, so [`DigestReader`] keeps a lookahead window exactly as
//! wide as the digest and only ever hashes bytes it can prove sit before
//! that window.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};

use sha1::{Digest, Sha1};

const READ_CHUNK: usize = 4096;

/// Marker wrapped in an [`io::Error`] when the underlying stream ends
/// before a full trailer's worth of bytes has been seen.
#[derive(Debug)]
pub(crate) struct TrailerTooShort;

impl fmt::Display for TrailerTooShort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream shorter than the trailer digest")
    }
}

impl std::error::Error for TrailerTooShort {}

pub(crate) fn is_trailer_too_short(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.is::<TrailerTooShort>())
}

/// Reads a byte stream whose last `trailer_len` bytes are a trailing
/// digest, exposing only the bytes that precede it and accumulating
/// those bytes into a running hash.
pub struct DigestReader<R: Read> {
    inner: R,
    hasher: Sha1,
    pending: VecDeque<u8>,
    trailer_len: usize,
    inner_eof: bool,
    sign_hash: Option<Vec<u8>>,
}

impl<R: Read> DigestReader<R> {
    /// Wraps `inner`, hashing everything but the final `H::output_size()`
    /// bytes into `hasher`. `hasher` may already have been primed (e.g.
    /// with a password preamble) before the stream body is read.
    pub fn new(inner: R, hasher: Sha1) -> Self {
        Self::with_trailer_len(inner, hasher, Sha1::output_size())
    }

    fn with_trailer_len(inner: R, hasher: Sha1, trailer_len: usize) -> Self {
        Self {
            inner,
            hasher,
            pending: VecDeque::new(),
            trailer_len,
            inner_eof: false,
            sign_hash: None,
        }
    }

    fn topup(&mut self, want_buffered: usize) -> io::Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        while !self.inner_eof && self.pending.len() < want_buffered {
            let n = self.inner.read(&mut chunk)?;
            if n == 0 {
                self.inner_eof = true;
                break;
            }
            self.pending.extend(chunk[..n].iter().copied());
        }
        Ok(())
    }

    /// Validates the trailing digest against the bytes hashed so far.
    ///
    /// # Errors
    ///
    /// Errors with `Ok(false)` semantics folded into the bool; fails the
    /// call entirely (returns `None`) if the stream has not been fully
    /// drained yet.
    #[must_use]
    pub fn verify_sign(&self) -> Option<bool> {
        let sign_hash = self.sign_hash.as_ref()?;
        let computed = self.hasher.clone().finalize();
        Some(computed.as_slice() == sign_hash.as_slice())
    }

    /// Returns `true` once end-of-stream has been observed and the
    /// trailing digest captured.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.sign_hash.is_some()
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.sign_hash.is_some() {
            return Ok(0);
        }

        self.topup(buf.len() + self.trailer_len)?;

        if self.inner_eof && self.pending.len() < self.trailer_len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                TrailerTooShort,
            ));
        }

        let safe = self.pending.len().saturating_sub(self.trailer_len);
        let n = safe.min(buf.len());

        for slot in &mut buf[..n] {
            *slot = self.pending.pop_front().expect("n bounded by safe above");
        }
        self.hasher.update(&buf[..n]);

        if self.inner_eof && self.pending.len() == self.trailer_len && self.sign_hash.is_none() {
            self.sign_hash = Some(self.pending.drain(..).collect());
        }

        Ok(n)
    }
}

/// Writes a byte stream and appends a trailing digest of everything
/// written once the caller calls [`DigestWriter::finish`].
pub struct DigestWriter<W: Write> {
    inner: W,
    hasher: Sha1,
}

impl<W: Write> DigestWriter<W> {
    /// Wraps `inner`. `hasher` may already be primed with a preamble.
    pub fn new(inner: W, hasher: Sha1) -> Self {
        Self { inner, hasher }
    }

    /// Appends the digest of everything written so far and returns the
    /// underlying writer.
    ///
    /// # Errors
    ///
    /// Errors if writing the trailer fails.
    pub fn finish(mut self) -> io::Result<W> {
        let digest = self.hasher.finalize();
        self.inner.write_all(&digest)?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn sha1_hex(bytes: &[u8]) -> String {
        let digest = Sha1::digest(bytes);
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn scenario_b_digest_reader_verify() {
        let body: Vec<u8> = (1..=16).collect();
        let trailer = Sha1::digest(&body);
        assert_eq!(
            sha1_hex(&body),
            "2cc4298324521346 29f1f6d296ec8aef b4e4d8a9".replace(' ', "")
        );

        let mut stream = body.clone();
        stream.extend_from_slice(&trailer);

        let mut reader = DigestReader::new(Cursor::new(stream), Sha1::new());
        let mut read_back = Vec::new();
        reader.read_to_end(&mut read_back).unwrap();

        assert_eq!(read_back, body);
        assert_eq!(reader.verify_sign(), Some(true));
    }

    #[test]
    fn verify_sign_none_before_full_drain() {
        let body: Vec<u8> = (1..=16).collect();
        let trailer = Sha1::digest(&body);
        let mut stream = body;
        stream.extend_from_slice(&trailer);

        let mut reader = DigestReader::new(Cursor::new(stream), Sha1::new());
        let mut small = [0u8; 1];
        reader.read_exact(&mut small).unwrap();

        assert_eq!(reader.verify_sign(), None);
    }

    #[test]
    fn verify_sign_false_on_tampered_trailer() {
        let body: Vec<u8> = (1..=16).collect();
        let mut trailer = Sha1::digest(&body).to_vec();
        trailer[0] ^= 0xFF;
        let mut stream = body;
        stream.extend_from_slice(&trailer);

        let mut reader = DigestReader::new(Cursor::new(stream), Sha1::new());
        let mut read_back = Vec::new();
        reader.read_to_end(&mut read_back).unwrap();

        assert_eq!(reader.verify_sign(), Some(false));
    }

    #[test]
    fn trailer_too_short_errors() {
        let mut reader = DigestReader::new(Cursor::new(vec![1, 2, 3]), Sha1::new());
        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).unwrap_err();
        assert!(is_trailer_too_short(&err));
    }

    #[test]
    fn small_reads_near_eof_split_tail_correctly() {
        let body: Vec<u8> = (1..=16).collect();
        let trailer = Sha1::digest(&body);
        let mut stream = body.clone();
        stream.extend_from_slice(&trailer);

        let mut reader = DigestReader::new(Cursor::new(stream), Sha1::new());
        let mut out = Vec::new();
        let mut one = [0u8; 1];
        loop {
            let n = reader.read(&mut one).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&one[..n]);
        }

        assert_eq!(out, body);
        assert_eq!(reader.verify_sign(), Some(true));
    }

    #[test]
    fn writer_appends_trailer() {
        let mut buf = Vec::new();
        {
            let mut writer = DigestWriter::new(&mut buf, Sha1::new());
            writer.write_all(&[1, 2, 3, 4]).unwrap();
            writer.finish().unwrap();
        }

        let (body, trailer) = buf.split_at(4);
        assert_eq!(body, [1, 2, 3, 4]);
        assert_eq!(trailer, Sha1::digest([1, 2, 3, 4]).as_slice());
    }
}
