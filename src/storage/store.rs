//! Page Store
//!
//! The durable side of the pool: tablespaces of fixed-size pages. The pool
//! only needs three operations, so the file layer stays outside this crate;
//! [`MemStore`] is the in-memory implementation used by tests and tools.

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::page::{self, page_type, PageId, SpaceId};

/// Durable page storage
pub trait PageStore: Send + Sync {
    /// Page size in bytes
    fn page_size(&self) -> usize;

    /// Number of pages in `space`, or `None` if it does not exist
    fn space_size(&self, space: SpaceId) -> Option<u32>;

    /// Read `page` into `buf` (exactly one page long)
    fn read_page(&self, page: PageId, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` (exactly one page long) to `page`
    fn write_page(&self, page: PageId, buf: &[u8]) -> Result<()>;
}

/// In-memory page store
pub struct MemStore {
    page_size: usize,
    spaces: RwLock<HashMap<SpaceId, Vec<Bytes>>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            spaces: RwLock::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Create (or replace) a tablespace of `pages` index pages linked into a
    /// single ascending leaf chain.
    pub fn create_space(&self, space: SpaceId, pages: u32) {
        let images = (0..pages)
            .map(|no| {
                let mut frame = BytesMut::zeroed(self.page_size);
                let prev = no.checked_sub(1);
                let next = (no + 1 < pages).then_some(no + 1);
                page::init_header(
                    &mut frame,
                    PageId { space, page_no: no },
                    prev,
                    next,
                    page_type::INDEX,
                );
                frame.freeze()
            })
            .collect();
        self.spaces.write().insert(space, images);
    }

    /// Drop a tablespace; returns whether it existed
    pub fn drop_space(&self, space: SpaceId) -> bool {
        self.spaces.write().remove(&space).is_some()
    }

    /// Current durable image of a page
    pub fn page(&self, page: PageId) -> Option<Bytes> {
        self.spaces
            .read()
            .get(&page.space)
            .and_then(|pages| pages.get(page.page_no as usize).cloned())
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn check_len(&self, page: PageId, len: usize) -> Result<()> {
        if len != self.page_size {
            return Err(Error::PageSizeMismatch {
                page,
                expected: self.page_size,
                actual: len,
            });
        }
        Ok(())
    }
}

impl PageStore for MemStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn space_size(&self, space: SpaceId) -> Option<u32> {
        self.spaces.read().get(&space).map(|p| p.len() as u32)
    }

    fn read_page(&self, page: PageId, buf: &mut [u8]) -> Result<()> {
        self.check_len(page, buf.len())?;
        let spaces = self.spaces.read();
        let pages = spaces
            .get(&page.space)
            .ok_or(Error::TablespaceNotFound { space: page.space })?;
        let image = pages
            .get(page.page_no as usize)
            .ok_or(Error::PageOutOfRange {
                page,
                size: pages.len() as u32,
            })?;
        buf.copy_from_slice(image);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_page(&self, page: PageId, buf: &[u8]) -> Result<()> {
        self.check_len(page, buf.len())?;
        let mut spaces = self.spaces.write();
        let pages = spaces
            .get_mut(&page.space)
            .ok_or(Error::TablespaceNotFound { space: page.space })?;
        let size = pages.len() as u32;
        let slot = pages
            .get_mut(page.page_no as usize)
            .ok_or(Error::PageOutOfRange { page, size })?;
        *slot = Bytes::copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
