//! Bounded packet descriptors over a shared receive buffer
//!
//! A pool holds (offset, length) descriptors into one receive buffer, so the
//! demux can regroup packets without copying payloads. Adds and lookups are
//! bounds-checked against the buffer; a descriptor never escapes it.

use tracing::warn;

/// Maximum packets per pool, matching what one tap read can produce.
pub const POOL_MAX: usize = 256;

pub struct Pool<'a> {
    buf: &'a [u8],
    items: Vec<(u32, u32)>,
}

impl<'a> Pool<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            items: Vec::with_capacity(POOL_MAX),
        }
    }

    /// Record a packet occupying `buf[offset..offset + len]`.
    pub fn add(&mut self, offset: usize, len: usize) -> bool {
        if self.items.len() >= POOL_MAX {
            warn!("packet pool full, dropping packet");
            return false;
        }
        if offset.checked_add(len).map_or(true, |end| end > self.buf.len()) {
            warn!("packet descriptor out of bounds, dropping packet");
            return false;
        }
        self.items.push((offset as u32, len as u32));
        true
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&'a [u8]> {
        let &(off, len) = self.items.get(i)?;
        Some(&self.buf[off as usize..(off + len) as usize])
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        (0..self.items.len()).filter_map(move |i| self.get(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_get() {
        let buf = b"hello world";
        let mut p = Pool::new(buf);
        assert!(p.add(0, 5));
        assert!(p.add(6, 5));
        assert_eq!(p.get(0), Some(&b"hello"[..]));
        assert_eq!(p.get(1), Some(&b"world"[..]));
        assert_eq!(p.get(2), None);
    }

    #[test]
    fn test_bounds_check() {
        let buf = [0u8; 16];
        let mut p = Pool::new(&buf);
        assert!(!p.add(10, 8));
        assert!(!p.add(usize::MAX, 2));
        assert!(p.is_empty());
    }

    #[test]
    fn test_capacity_limit() {
        let buf = [0u8; 16];
        let mut p = Pool::new(&buf);
        for _ in 0..POOL_MAX {
            assert!(p.add(0, 1));
        }
        assert!(!p.add(0, 1));
        assert_eq!(p.len(), POOL_MAX);
    }
}
