//! Allocator of small unsigned integers for tags and fids.

use std::sync::Mutex;

/// How many bytes the bitmap grows by when it runs out of room.
const GROW: usize = 32;

/// A release-and-reuse id allocator.
///
/// `acquire` hands out the lowest free id below `max`; `release` returns
/// it. `max` is the reserved sentinel of the id space (`NOTAG` for tags,
/// `NOFID` for fids) and is never handed out. The bitmap grows on demand,
/// and a search hint keeps acquisition amortised O(1) under the usual
/// acquire/release churn.
#[derive(Debug)]
pub struct Pool {
    max: u32,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    imap: Vec<u8>,
    /// No id below this one is free.
    hint: u32,
}

impl Pool {
    /// Create a pool handing out ids in `[0, max)`.
    pub fn new(max: u32) -> Pool {
        Pool {
            max,
            inner: Mutex::new(Inner {
                imap: Vec::new(),
                hint: 0,
            }),
        }
    }

    /// Take the lowest free id, or `None` when the space is exhausted.
    pub fn acquire(&self) -> Option<u32> {
        let mut inner = self.inner.lock().unwrap();

        let mut id = inner.hint;
        loop {
            if id >= self.max {
                return None;
            }

            let byte = (id / 8) as usize;
            if byte >= inner.imap.len() {
                let grown = inner.imap.len() + GROW;
                inner.imap.resize(grown, 0);
            }

            if inner.imap[byte] == 0xff {
                // Skip to the next byte boundary.
                id = (id | 7) + 1;
                continue;
            }

            let bit = (id % 8) as u8;
            if inner.imap[byte] & (1 << bit) == 0 {
                inner.imap[byte] |= 1 << bit;
                inner.hint = id + 1;
                return Some(id);
            }
            id += 1;
        }
    }

    /// Return an id to the pool.
    pub fn release(&self, id: u32) {
        let mut inner = self.inner.lock().unwrap();

        let byte = (id / 8) as usize;
        if byte < inner.imap.len() {
            inner.imap[byte] &= !(1 << (id % 8) as u8);
            if id < inner.hint {
                inner.hint = id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lowest_first() {
        let pool = Pool::new(100);
        assert_eq!(pool.acquire(), Some(0));
        assert_eq!(pool.acquire(), Some(1));
        assert_eq!(pool.acquire(), Some(2));
    }

    #[test]
    fn release_reuses_lowest() {
        let pool = Pool::new(100);
        for _ in 0..10 {
            pool.acquire();
        }
        pool.release(3);
        pool.release(7);
        assert_eq!(pool.acquire(), Some(3));
        assert_eq!(pool.acquire(), Some(7));
        assert_eq!(pool.acquire(), Some(10));
    }

    #[test]
    fn sentinel_excluded() {
        let pool = Pool::new(3);
        assert_eq!(pool.acquire(), Some(0));
        assert_eq!(pool.acquire(), Some(1));
        assert_eq!(pool.acquire(), Some(2));
        assert_eq!(pool.acquire(), None);
        pool.release(1);
        assert_eq!(pool.acquire(), Some(1));
    }

    #[test]
    fn grows_past_first_chunk() {
        let pool = Pool::new(10_000);
        for i in 0..2_000 {
            assert_eq!(pool.acquire(), Some(i));
        }
    }

    #[test]
    fn concurrent_ids_are_distinct() {
        let pool = Arc::new(Pool::new(!0u32));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                (0..500).map(|_| pool.acquire().unwrap()).collect::<Vec<_>>()
            }));
        }

        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
