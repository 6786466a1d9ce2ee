//! Source of random bytes used for salts and IVs.

use rand::TryRngCore;
use rand::rngs::OsRng;

use crate::error::{KeystoreError, Result};

/// Abstracts "fill this buffer with random bytes" so encryption paths are
/// testable with a fixed byte source instead of the platform CSPRNG.
pub trait RandomSource {
    /// Fills `buf` with random bytes.
    ///
    /// # Errors
    ///
    /// Errors if the underlying source cannot produce random bytes.
    fn fill(&mut self, buf: &mut [u8]) -> Result<()>;
}

/// Default [`RandomSource`] backed by the platform cryptographic RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandomSource;

impl RandomSource for OsRandomSource {
    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|_| KeystoreError::RandomSourceFailed)
    }
}

#[cfg(test)]
pub(crate) struct FixedRandomSource(pub Vec<u8>);

#[cfg(test)]
impl RandomSource for FixedRandomSource {
    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        assert!(self.0.len() >= buf.len(), "fixed random source exhausted");
        let rest = self.0.split_off(buf.len());
        buf.copy_from_slice(&self.0);
        self.0 = rest;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_random_source_fills_buffer() {
        let mut buf = [0u8; 16];
        OsRandomSource.fill(&mut buf).unwrap();
        assert_ne!(buf, [0u8; 16]);
    }

    #[test]
    fn fixed_random_source_returns_bytes_in_order() {
        let mut src = FixedRandomSource(vec![1, 2, 3, 4, 5, 6]);
        let mut buf = [0u8; 4];
        src.fill(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        let mut buf = [0u8; 2];
        src.fill(&mut buf).unwrap();
        assert_eq!(buf, [5, 6]);
    }
}
