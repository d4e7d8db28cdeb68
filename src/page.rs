//! Page identity and on-page header layout
//!
//! Every page starts with a fixed header. The pool only reads a few fields
//! from it: the page number and tablespace id (to find the owner of a
//! compressed image during buddy relocation) and the prev/next pointers of
//! index leaf chains (for linear read-ahead).
//!
//! ```text
//! offset  size  field
//!      0     4  checksum
//!      4     4  page number
//!      8     4  previous page in the chain (FIL_NULL if none)
//!     12     4  next page in the chain (FIL_NULL if none)
//!     16     8  LSN of the newest modification
//!     24     2  page type
//!     26     8  flush LSN (first page of the system space only)
//!     34     4  tablespace id
//! ```
//!
//! All integers are big-endian.

use serde::{Deserialize, Serialize};
use std::fmt;

/// "No page" marker for header pointers
pub const FIL_NULL: u32 = u32::MAX;

/// Page number of the transaction-system header in the system tablespace
pub const TRX_SYS_PAGE_NO: u32 = 5;

/// Offset of the insert-buffer bitmap page within each descriptor group
pub const IBUF_BITMAP_OFFSET: u32 = 1;

/// Header field offsets
pub mod header {
    pub const CHECKSUM: usize = 0;
    pub const PAGE_NO: usize = 4;
    pub const PREV: usize = 8;
    pub const NEXT: usize = 12;
    pub const LSN: usize = 16;
    pub const PAGE_TYPE: usize = 24;
    pub const FLUSH_LSN: usize = 26;
    pub const SPACE_ID: usize = 34;
    /// Total header length
    pub const LEN: usize = 38;
}

/// Page type codes stored at [`header::PAGE_TYPE`]
pub mod page_type {
    pub const ALLOCATED: u16 = 0;
    pub const UNDO_LOG: u16 = 2;
    pub const INODE: u16 = 3;
    pub const IBUF_BITMAP: u16 = 5;
    pub const TRX_SYS: u16 = 7;
    pub const INDEX: u16 = 17855;
}

/// Tablespace identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpaceId(pub u32);

impl SpaceId {
    /// The system tablespace
    pub const SYSTEM: SpaceId = SpaceId(0);
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A page address: tablespace plus page number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId {
    pub space: SpaceId,
    pub page_no: u32,
}

impl PageId {
    pub const fn new(space: u32, page_no: u32) -> Self {
        Self {
            space: SpaceId(space),
            page_no,
        }
    }

    /// Same tablespace, another page number
    pub const fn with_page_no(self, page_no: u32) -> Self {
        Self {
            space: self.space,
            page_no,
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[space {}, page {}]", self.space.0, self.page_no)
    }
}

/// Pages whose access order is fixed by the engine and must never be read
/// ahead: insert-buffer bitmap pages and the transaction-system header.
///
/// Bitmap pages recur once per descriptor group, which spans as many pages
/// as a page has bytes.
pub fn is_ordered_page(page: PageId, page_size: usize) -> bool {
    let group = page_size as u32;
    page.page_no % group == IBUF_BITMAP_OFFSET
        || (page.space == SpaceId::SYSTEM && page.page_no == TRX_SYS_PAGE_NO)
}

pub fn read_u32(frame: &[u8], offset: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&frame[offset..offset + 4]);
    u32::from_be_bytes(b)
}

pub fn write_u32(frame: &mut [u8], offset: usize, value: u32) {
    frame[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

pub fn read_u64(frame: &[u8], offset: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&frame[offset..offset + 8]);
    u64::from_be_bytes(b)
}

pub fn write_u64(frame: &mut [u8], offset: usize, value: u64) {
    frame[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

/// Page id recorded in the header
pub fn page_id(frame: &[u8]) -> PageId {
    PageId::new(
        read_u32(frame, header::SPACE_ID),
        read_u32(frame, header::PAGE_NO),
    )
}

/// Previous page in the chain, if any
pub fn prev_page(frame: &[u8]) -> Option<u32> {
    match read_u32(frame, header::PREV) {
        FIL_NULL => None,
        p => Some(p),
    }
}

/// Next page in the chain, if any
pub fn next_page(frame: &[u8]) -> Option<u32> {
    match read_u32(frame, header::NEXT) {
        FIL_NULL => None,
        n => Some(n),
    }
}

pub fn page_type_of(frame: &[u8]) -> u16 {
    u16::from_be_bytes([frame[header::PAGE_TYPE], frame[header::PAGE_TYPE + 1]])
}

pub fn lsn(frame: &[u8]) -> u64 {
    read_u64(frame, header::LSN)
}

pub fn set_lsn(frame: &mut [u8], lsn: u64) {
    write_u64(frame, header::LSN, lsn);
}

/// Write a fresh header
pub fn init_header(frame: &mut [u8], page: PageId, prev: Option<u32>, next: Option<u32>, kind: u16) {
    frame[..header::LEN].fill(0);
    write_u32(frame, header::PAGE_NO, page.page_no);
    write_u32(frame, header::PREV, prev.unwrap_or(FIL_NULL));
    write_u32(frame, header::NEXT, next.unwrap_or(FIL_NULL));
    frame[header::PAGE_TYPE..header::PAGE_TYPE + 2].copy_from_slice(&kind.to_be_bytes());
    write_u32(frame, header::SPACE_ID, page.space.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip_fields() {
        let mut frame = vec![0u8; 4096];
        let page = PageId::new(7, 42);
        init_header(&mut frame, page, Some(41), None, page_type::INDEX);
        set_lsn(&mut frame, 0xDEAD_BEEF_0001);

        assert_eq!(page_id(&frame), page);
        assert_eq!(prev_page(&frame), Some(41));
        assert_eq!(next_page(&frame), None);
        assert_eq!(page_type_of(&frame), page_type::INDEX);
        assert_eq!(lsn(&frame), 0xDEAD_BEEF_0001);
        assert_eq!(read_u32(&frame, header::NEXT), FIL_NULL);
    }

    #[test]
    fn test_ordered_pages() {
        let page_size = 4096;
        assert!(is_ordered_page(PageId::new(3, 1), page_size));
        assert!(is_ordered_page(PageId::new(3, 4097), page_size));
        assert!(is_ordered_page(PageId::new(0, TRX_SYS_PAGE_NO), page_size));
        assert!(!is_ordered_page(PageId::new(3, TRX_SYS_PAGE_NO), page_size));
        assert!(!is_ordered_page(PageId::new(3, 2), page_size));
    }

    #[test]
    fn test_page_id_display() {
        assert_eq!(PageId::new(1, 2).to_string(), "[space 1, page 2]");
    }
}
