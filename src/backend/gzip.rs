//! Gzip page compression.
//!
//! Each stored buffer ends with a tag byte: `0` for raw data (compression
//! would not have saved space), `1` for a gzip stream.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use super::BackendError;
use super::transform::PageTransform;

const TAG_STORED: u8 = 0;
const TAG_GZIP: u8 = 1;

#[derive(Debug, Default, Clone, Copy)]
pub struct GzipTransform;

impl PageTransform for GzipTransform {
    fn max_page_size_overhead(&self) -> u16 {
        1
    }

    fn transform(&self, bytes: &[u8]) -> Result<Vec<u8>, BackendError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(bytes)
            .map_err(|e| BackendError::with_source("gzip compression failed", e))?;
        let mut compressed = encoder
            .finish()
            .map_err(|e| BackendError::with_source("gzip compression failed", e))?;

        if compressed.len() < bytes.len() {
            compressed.push(TAG_GZIP);
            Ok(compressed)
        } else {
            let mut stored = Vec::with_capacity(bytes.len() + 1);
            stored.extend_from_slice(bytes);
            stored.push(TAG_STORED);
            Ok(stored)
        }
    }

    fn reverse_transform(&self, bytes: &[u8]) -> Result<Vec<u8>, BackendError> {
        let Some((&tag, data)) = bytes.split_last() else {
            return Err(BackendError::new("empty compressed page"));
        };

        match tag {
            TAG_STORED => Ok(data.to_vec()),
            TAG_GZIP => {
                let mut out = Vec::new();
                GzDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| BackendError::with_source("gzip decompression failed", e))?;
                Ok(out)
            }
            other => Err(BackendError::new(format!(
                "unknown compression tag {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressible_pages_are_tagged_and_shrink() {
        let transform = GzipTransform;
        let page = vec![0u8; 8192];

        let stored = transform.transform(&page).unwrap();

        assert_eq!(stored.last(), Some(&TAG_GZIP));
        assert!(stored.len() < page.len());
        assert_eq!(transform.reverse_transform(&stored).unwrap(), page);
    }

    #[test]
    fn incompressible_pages_are_stored_raw() {
        let transform = GzipTransform;
        // a short buffer of high-entropy bytes gains nothing from gzip
        let page: Vec<u8> = (0u16..64)
            .map(|i| (i.wrapping_mul(251) ^ (i >> 3)) as u8)
            .collect();

        let stored = transform.transform(&page).unwrap();

        assert_eq!(stored.last(), Some(&TAG_STORED));
        assert_eq!(stored.len(), page.len() + 1);
        assert_eq!(transform.reverse_transform(&stored).unwrap(), page);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let transform = GzipTransform;

        assert!(transform.reverse_transform(&[1, 2, 3, 9]).is_err());
        assert!(transform.reverse_transform(&[]).is_err());
    }
}
