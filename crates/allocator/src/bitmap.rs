//! Bit-indexed occupancy set.
//!
//! A [`Bitmap`] borrows a byte slice and interprets bit `i` as the state of
//! entry `i`: bit `i % 8` of byte `i / 8`. It is used by the
//! [`Slab`](crate::slab::Slab) allocator to track which slots are taken, but
//! has no knowledge of slots itself.

/// Returns the number of bytes needed to hold `entries` bits.
#[must_use]
pub const fn byte_len(entries: usize) -> usize {
    entries.div_ceil(8)
}

#[inline]
const fn byte_index(entry: usize) -> usize {
    entry / 8
}

#[inline]
const fn bit_mask(entry: usize) -> u8 {
    1 << (entry % 8)
}

/// A bitmap stored in borrowed or owned bytes.
///
/// Queries only need `B: AsRef<[u8]>`, so a shared slice gives a read-only
/// view. Updates need `B: AsMut<[u8]>` as well.
#[derive(Debug)]
pub struct Bitmap<B> {
    bytes: B,
}

impl<B> Bitmap<B>
where
    B: AsRef<[u8]>,
{
    /// Wraps `bytes` as a bitmap of `bytes.len() * 8` entries.
    pub fn new(bytes: B) -> Self {
        Self { bytes }
    }

    fn bytes(&self) -> &[u8] {
        self.bytes.as_ref()
    }

    /// Returns the number of entries the backing memory can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.bytes().len() * 8
    }

    /// Returns whether `entry` is set.
    ///
    /// # Panics
    ///
    /// Panics if `entry` is beyond the capacity of the bitmap.
    #[must_use]
    pub fn get(&self, entry: usize) -> bool {
        self.bytes()[byte_index(entry)] & bit_mask(entry) != 0
    }

    /// Returns the first clear entry below `limit`.
    ///
    /// Fully occupied bytes are skipped whole.
    #[must_use]
    pub fn first_clear(&self, limit: usize) -> Option<usize> {
        let limit = limit.min(self.capacity());
        let mut entry = 0;
        while entry < limit {
            if entry % 8 == 0 && self.bytes()[byte_index(entry)] == 0xff {
                entry += 8;
                continue;
            }
            if !self.get(entry) {
                return Some(entry);
            }
            entry += 1;
        }
        None
    }

    /// Counts the set entries below `limit`.
    #[must_use]
    pub fn count_set(&self, limit: usize) -> usize {
        let limit = limit.min(self.capacity());
        (0..limit).filter(|&entry| self.get(entry)).count()
    }
}

impl<B> Bitmap<B>
where
    B: AsRef<[u8]> + AsMut<[u8]>,
{
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.bytes.as_mut()
    }

    /// Clears every entry.
    pub fn clear_all(&mut self) {
        self.bytes_mut().fill(0);
    }

    /// Sets `entry`.
    ///
    /// # Panics
    ///
    /// Panics if `entry` is beyond the capacity of the bitmap.
    pub fn set(&mut self, entry: usize) {
        self.bytes_mut()[byte_index(entry)] |= bit_mask(entry);
    }

    /// Clears `entry`.
    ///
    /// # Panics
    ///
    /// Panics if `entry` is beyond the capacity of the bitmap.
    pub fn clear(&mut self, entry: usize) {
        self.bytes_mut()[byte_index(entry)] &= !bit_mask(entry);
    }
}
