//! Compressed page images
//!
//! An image keeps the page header uncompressed so that the owner of a buddy
//! block can be identified from its first bytes, followed by the LZ4 block
//! of the remainder of the page:
//!
//! ```text
//! ┌──────────────────────┬─────────────────────────────────────────┐
//! │ page header (38 B)   │ LZ4 block (size-prefixed) of the body   │
//! └──────────────────────┴─────────────────────────────────────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::page::header;

/// LZ4 compression level used for page images
pub const DEFAULT_LEVEL: i32 = 4;

/// Compressor for page images
#[derive(Debug, Clone, Copy)]
pub struct PageCompressor {
    level: i32,
}

impl Default for PageCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl PageCompressor {
    pub fn new() -> Self {
        Self {
            level: DEFAULT_LEVEL,
        }
    }

    pub fn with_level(level: i32) -> Self {
        Self { level }
    }

    /// Compress a full page frame into an image
    pub fn compress(&self, frame: &[u8]) -> Result<Bytes> {
        if frame.len() < header::LEN {
            return Err(Error::CompressionFailed {
                algorithm: "LZ4".into(),
                reason: format!("frame of {} bytes is shorter than a page header", frame.len()),
            });
        }
        let body = lz4::block::compress(
            &frame[header::LEN..],
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })?;

        let mut image = BytesMut::with_capacity(header::LEN + body.len());
        image.put_slice(&frame[..header::LEN]);
        image.put_slice(&body);
        Ok(image.freeze())
    }

    /// Rebuild the full frame from an image
    pub fn decompress(&self, image: &[u8], page_size: usize) -> Result<Vec<u8>> {
        if image.len() < header::LEN {
            return Err(Error::DecompressionFailed {
                algorithm: "LZ4".into(),
                reason: format!("image of {} bytes is shorter than a page header", image.len()),
            });
        }
        let body = lz4::block::decompress(&image[header::LEN..], None).map_err(|e| {
            Error::DecompressionFailed {
                algorithm: "LZ4".into(),
                reason: e.to_string(),
            }
        })?;
        if header::LEN + body.len() != page_size {
            return Err(Error::DecompressionFailed {
                algorithm: "LZ4".into(),
                reason: format!(
                    "decompressed to {} bytes, page size is {}",
                    header::LEN + body.len(),
                    page_size
                ),
            });
        }
        let mut frame = Vec::with_capacity(page_size);
        frame.extend_from_slice(&image[..header::LEN]);
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}
