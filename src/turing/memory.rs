//! Paged virtual memory for Turing programs.
//!
//! Addresses are `f64`. The page of an address is `floor(address / 4096)` and
//! its slot is `floor(address % 4096)`, with negative slots folded to
//! `4095 - slot`. Pages come from a process-wide pool and go back to it,
//! cleared, when their manager is dropped.

use std::sync::{Mutex, PoisonError};

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use crate::error::Signal;

pub const PAGE_SIZE: usize = 4096;

/// Process-wide page pool shared by every execution.
pub static PAGE_POOL: Lazy<PagePool> = Lazy::new(PagePool::new);

type Page = Box<[f64]>;

/// A concurrent pool of cleared pages. Pages are fungible, so there is no
/// ordering between returns and takes.
#[derive(Debug, Default)]
pub struct PagePool {
    pages: Mutex<Vec<Page>>,
}

impl PagePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A zeroed page, reused when one is available.
    pub fn take(&self) -> Page {
        let page = self
            .pages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        page.unwrap_or_else(|| vec![0.0; PAGE_SIZE].into_boxed_slice())
    }

    /// Clear `page` and make it available again.
    pub fn give(&self, mut page: Page) {
        page.fill(0.0);
        self.pages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(page);
    }

    pub fn len(&self) -> usize {
        self.pages.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sparse page table owned by a single execution.
#[derive(Debug)]
pub struct VirtualMemoryManager<'p> {
    pool: &'p PagePool,
    pages: FxHashMap<u64, Page>,
    max_pages: usize,
}

impl VirtualMemoryManager<'static> {
    /// A manager drawing from the process-wide pool.
    pub fn new(max_pages: usize) -> Self {
        VirtualMemoryManager::with_pool(&PAGE_POOL, max_pages)
    }
}

impl<'p> VirtualMemoryManager<'p> {
    pub fn with_pool(pool: &'p PagePool, max_pages: usize) -> Self {
        Self {
            pool,
            pages: FxHashMap::default(),
            max_pages,
        }
    }

    /// Read `address`. Non-finite addresses read NaN. Anything never
    /// written reads 0, including slots that fold past the end of a page.
    pub fn read(&self, address: f64) -> Result<f64, Signal> {
        if !address.is_finite() {
            return Ok(f64::NAN);
        }

        match (self.pages.get(&page_key(address)), slot(address)) {
            (Some(page), Ok(slot)) => Ok(page[slot]),
            _ => Ok(0.0),
        }
    }

    /// Write `value` at `address`. Writes to non-finite addresses are
    /// ignored. A slot folding past the end of its page raises
    /// `Signal::AddressOutOfRange` without touching the page table; touching
    /// a new page past the budget raises `Signal::MemoryExhausted`.
    pub fn write(&mut self, address: f64, value: f64) -> Result<(), Signal> {
        if !address.is_finite() {
            return Ok(());
        }

        let slot = slot(address)?;
        let key = page_key(address);
        if !self.pages.contains_key(&key) {
            if self.pages.len() >= self.max_pages {
                return Err(Signal::MemoryExhausted);
            }
            self.pages.insert(key, self.pool.take());
        }

        if let Some(page) = self.pages.get_mut(&key) {
            page[slot] = value;
        }

        Ok(())
    }

    pub fn pages_in_use(&self) -> usize {
        self.pages.len()
    }
}

impl Drop for VirtualMemoryManager<'_> {
    fn drop(&mut self) {
        for (_, page) in self.pages.drain() {
            self.pool.give(page);
        }
    }
}

fn page_key(address: f64) -> u64 {
    // -0.0 and 0.0 share a page
    ((address / PAGE_SIZE as f64).floor() + 0.0).to_bits()
}

fn slot(address: f64) -> Result<usize, Signal> {
    let mut index = (address % PAGE_SIZE as f64).floor() as i64;
    if index < 0 {
        index = PAGE_SIZE as i64 - 1 - index;
    }

    if index >= PAGE_SIZE as i64 {
        return Err(Signal::AddressOutOfRange);
    }
    Ok(index as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_unwritten_is_zero() {
        let pool = PagePool::new();
        let memory = VirtualMemoryManager::with_pool(&pool, 1);

        assert_eq!(memory.read(12345.0), Ok(0.0));
        assert_eq!(memory.read(-7.5), Ok(0.0));
    }

    #[test]
    fn test_write_then_read() {
        let pool = PagePool::new();
        let mut memory = VirtualMemoryManager::with_pool(&pool, 2);

        memory.write(10.7, 3.5).unwrap();
        assert_eq!(memory.read(10.2), Ok(3.5));
        assert_eq!(memory.read(11.0), Ok(0.0));

        memory.write(4096.0 * 3.0 + 1.0, 8.0).unwrap();
        assert_eq!(memory.read(4096.0 * 3.0 + 1.0), Ok(8.0));
        assert_eq!(memory.pages_in_use(), 2);
    }

    #[test]
    fn test_page_budget() {
        let pool = PagePool::new();
        let mut memory = VirtualMemoryManager::with_pool(&pool, 1);

        memory.write(1.0, 1.0).unwrap();
        memory.write(4000.0, 2.0).unwrap();
        assert_eq!(memory.write(5000.0, 3.0), Err(Signal::MemoryExhausted));
    }

    #[test]
    fn test_non_finite_addresses() {
        let pool = PagePool::new();
        let mut memory = VirtualMemoryManager::with_pool(&pool, 0);

        assert!(memory.read(f64::NAN).unwrap().is_nan());
        assert!(memory.read(f64::INFINITY).unwrap().is_nan());
        assert_eq!(memory.write(f64::NEG_INFINITY, 1.0), Ok(()));
        assert_eq!(memory.pages_in_use(), 0);
    }

    #[test]
    fn test_negative_slot_folding() {
        let pool = PagePool::new();
        let mut memory = VirtualMemoryManager::with_pool(&pool, 4);

        // whole multiples of the page size land on slot 0 of a negative page
        memory.write(-4096.0, 6.0).unwrap();
        assert_eq!(memory.read(-4096.0), Ok(6.0));

        // any other negative address folds past the end of the page
        assert_eq!(memory.write(-1.0, 1.0), Err(Signal::AddressOutOfRange));
    }

    #[test]
    fn test_unwritten_folded_read_on_touched_page_is_zero() {
        let pool = PagePool::new();
        let mut memory = VirtualMemoryManager::with_pool(&pool, 1);
        assert_eq!(memory.read(-1.0), Ok(0.0));

        memory.write(-4096.0, 1.0).unwrap();
        assert_eq!(memory.read(-1.0), Ok(0.0));
        assert_eq!(memory.read(-4095.5), Ok(0.0));
        assert_eq!(memory.read(-4096.0), Ok(1.0));
    }

    #[test]
    fn test_rejected_write_keeps_page_budget() {
        let pool = PagePool::new();
        let mut memory = VirtualMemoryManager::with_pool(&pool, 1);

        assert_eq!(memory.write(-1.0, 1.0), Err(Signal::AddressOutOfRange));
        assert_eq!(memory.pages_in_use(), 0);

        memory.write(10.0, 2.0).unwrap();
        assert_eq!(memory.read(10.0), Ok(2.0));
    }

    #[test]
    fn test_pages_return_to_pool_cleared() {
        let pool = PagePool::new();
        {
            let mut memory = VirtualMemoryManager::with_pool(&pool, 2);
            memory.write(5.0, 9.0).unwrap();
            memory.write(9000.0, 9.0).unwrap();
        }
        assert_eq!(pool.len(), 2);

        let page = pool.take();
        assert!(page.iter().all(|value| *value == 0.0));
        assert_eq!(pool.len(), 1);
    }
}
