//! Platform memory-range table.
//!
//! Wire format (little endian, packed):
//!
//! ```text
//! u8  version     only 1 is understood
//! u8  bus number
//! u8  bitmap      one bit per populated slot
//! [u64 lower, u64 upper] x popcount(bitmap)
//! ```
//!
//! Any other version means "no favored ranges", never an error.

pub const MEMORY_RANGE_TABLE_V1: u8 = 1;
pub const MEMORY_RANGE_HEADER_SIZE: usize = 3;
pub const MEMORY_RANGE_ENTRY_SIZE: usize = 16;
pub const MEMORY_RANGE_MAX_SLOTS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRangeEntry {
    pub lower: u64,
    pub upper: u64,
}

/// Parsed view over a raw memory-range table.
#[derive(Clone, Copy, Debug)]
pub struct MemoryRangeTable<'a> {
    bus: u8,
    bitmap: u8,
    entries: &'a [u8],
}

impl<'a> MemoryRangeTable<'a> {
    /// Returns `None` for an unknown version or a truncated header.
    pub fn parse(raw: &'a [u8]) -> Option<Self> {
        if raw.len() < MEMORY_RANGE_HEADER_SIZE || raw[0] != MEMORY_RANGE_TABLE_V1 {
            return None;
        }
        Some(Self {
            bus: raw[1],
            bitmap: raw[2],
            entries: &raw[MEMORY_RANGE_HEADER_SIZE..],
        })
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    /// Number of populated slots declared by the bitmap.
    pub fn declared_count(&self) -> usize {
        self.bitmap.count_ones() as usize
    }

    /// Declared entries actually present in the buffer, in slot order.
    pub fn iter(&self) -> MemoryRangeIter<'a> {
        MemoryRangeIter {
            remaining: self.declared_count(),
            entries: self.entries,
        }
    }
}

pub struct MemoryRangeIter<'a> {
    remaining: usize,
    entries: &'a [u8],
}

impl Iterator for MemoryRangeIter<'_> {
    type Item = MemoryRangeEntry;

    fn next(&mut self) -> Option<MemoryRangeEntry> {
        if self.remaining == 0 || self.entries.len() < MEMORY_RANGE_ENTRY_SIZE {
            return None;
        }
        self.remaining -= 1;
        let (entry, rest) = self.entries.split_at(MEMORY_RANGE_ENTRY_SIZE);
        self.entries = rest;
        let mut lower = [0u8; 8];
        let mut upper = [0u8; 8];
        lower.copy_from_slice(&entry[..8]);
        upper.copy_from_slice(&entry[8..]);
        Some(MemoryRangeEntry {
            lower: u64::from_le_bytes(lower),
            upper: u64::from_le_bytes(upper),
        })
    }
}

/// Serialise a v1 table into `out`. Returns the number of bytes written, or
/// `None` if `out` is too small or more than eight ranges are supplied.
pub fn write_memory_range_table(
    out: &mut [u8],
    bus: u8,
    ranges: &[MemoryRangeEntry],
) -> Option<usize> {
    if ranges.len() > MEMORY_RANGE_MAX_SLOTS {
        return None;
    }
    let total = MEMORY_RANGE_HEADER_SIZE + ranges.len() * MEMORY_RANGE_ENTRY_SIZE;
    if out.len() < total {
        return None;
    }
    out[0] = MEMORY_RANGE_TABLE_V1;
    out[1] = bus;
    out[2] = ((1u16 << ranges.len()) - 1) as u8;
    for (slot, range) in ranges.iter().enumerate() {
        let at = MEMORY_RANGE_HEADER_SIZE + slot * MEMORY_RANGE_ENTRY_SIZE;
        out[at..at + 8].copy_from_slice(&range.lower.to_le_bytes());
        out[at + 8..at + 16].copy_from_slice(&range.upper.to_le_bytes());
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_v1_table() {
        let ranges = [
            MemoryRangeEntry { lower: 0x1000_0000, upper: 0x1FFF_FFFF },
            MemoryRangeEntry { lower: 0x4000_0000, upper: 0x7FFF_FFFF },
        ];
        let mut buf = [0u8; 64];
        let len = write_memory_range_table(&mut buf, 2, &ranges).unwrap();
        assert_eq!(len, 3 + 2 * 16);
        assert_eq!(buf[2], 0b11);

        let table = MemoryRangeTable::parse(&buf[..len]).unwrap();
        assert_eq!(table.bus(), 2);
        assert_eq!(table.declared_count(), 2);
        let parsed: [MemoryRangeEntry; 2] = {
            let mut it = table.iter();
            [it.next().unwrap(), it.next().unwrap()]
        };
        assert_eq!(parsed, ranges);
    }

    #[test]
    fn test_unknown_version_yields_nothing() {
        let buf = [2u8, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0, 0, 0, 0, 0, 0, 0];
        assert!(MemoryRangeTable::parse(&buf).is_none());
    }

    #[test]
    fn test_truncated_entries_are_not_read() {
        let mut buf = [0u8; 3 + 16 + 4];
        buf[0] = MEMORY_RANGE_TABLE_V1;
        buf[2] = 0b0000_0011;
        let table = MemoryRangeTable::parse(&buf).unwrap();
        assert_eq!(table.declared_count(), 2);
        assert_eq!(table.iter().count(), 1);
    }
}
