/*!
 * Range partitioning for multipart transfers
 */

use serde::{Deserialize, Serialize};

use crate::error::{TransferError, TransferResult};

/// One contiguous byte range of a multipart transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    /// Zero-based position in the part sequence
    pub index: usize,

    /// First byte of the part (inclusive, absolute object offset)
    pub start: u64,

    /// Last byte of the part (inclusive, absolute object offset)
    pub end: u64,

    /// Start of the whole transfer span
    pub offset: u64,

    /// One-based multipart part number
    pub number: u32,
}

impl Part {
    /// Part length in bytes
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Position of the part relative to the span start (local file offset)
    pub fn relative_start(&self) -> u64 {
        self.start - self.offset
    }
}

/// Requested byte range of a download (inclusive, open-ended when `end` is `None`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    /// First requested byte
    pub start: u64,

    /// Last requested byte
    pub end: Option<u64>,
}

impl ByteRange {
    /// Range `start..=end`
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// Range from `start` to the end of the object
    pub fn starting_at(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Clamp the range to an object of `size` bytes, returning the inclusive span
    ///
    /// A range starting exactly at the end of the object is empty and resolves
    /// to `None`; starting past the end is an error.
    pub fn resolve(&self, size: u64) -> TransferResult<Option<(u64, u64)>> {
        if self.start > size {
            return Err(TransferError::InvalidRange(format!(
                "start {} is beyond the {} byte object",
                self.start, size
            )));
        }
        if let Some(end) = self.end {
            if end < self.start {
                return Err(TransferError::InvalidRange(format!(
                    "end {} precedes start {}",
                    end, self.start
                )));
            }
        }
        if self.start == size {
            return Ok(None);
        }
        let end = self.end.map_or(size - 1, |end| end.min(size - 1));
        Ok(Some((self.start, end)))
    }
}

impl std::str::FromStr for ByteRange {
    type Err = TransferError;

    /// Parse `start-end` or `start-`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransferError::InvalidRange(format!("expected start-end, got {:?}", s));
        let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;
        let start = start.trim().parse::<u64>().map_err(|_| invalid())?;
        let end = match end.trim() {
            "" => None,
            end => Some(end.parse::<u64>().map_err(|_| invalid())?),
        };
        if matches!(end, Some(end) if end < start) {
            return Err(invalid());
        }
        Ok(Self { start, end })
    }
}

/// Number of parts needed to cover `total` bytes with `part_size` byte parts
pub fn part_count(total: u64, part_size: u64) -> u64 {
    if part_size == 0 {
        return 0;
    }
    total.div_ceil(part_size)
}

/// Split the inclusive span `start..=end` into consecutive parts of `part_size` bytes
///
/// Every part except the last is exactly `part_size` long; the last covers
/// the remainder. A non-empty span always yields at least one part.
pub fn partition(start: u64, end: u64, part_size: u64) -> TransferResult<Vec<Part>> {
    if part_size == 0 {
        return Err(TransferError::InvalidConfig(
            "Part size must be at least 1 byte".to_string(),
        ));
    }
    if start > end {
        return Err(TransferError::InvalidRange(format!(
            "span start {} is past span end {}",
            start, end
        )));
    }

    // Index of the last part
    let last = (end - start) / part_size;
    if last >= u32::MAX as u64 {
        return Err(TransferError::InvalidConfig(format!(
            "{} parts exceed the part number range",
            last as u128 + 1
        )));
    }

    let mut parts = Vec::with_capacity(last as usize + 1);
    let mut cursor = start;
    loop {
        let part_end = cursor.saturating_add(part_size - 1).min(end);
        let index = parts.len();
        parts.push(Part {
            index,
            start: cursor,
            end: part_end,
            offset: start,
            number: index as u32 + 1,
        });
        if part_end == end {
            break;
        }
        cursor = part_end + 1;
    }

    Ok(parts)
}

/// Partition an object (or file) of `size` bytes; empty input yields no parts
pub fn partition_size(size: u64, part_size: u64) -> TransferResult<Vec<Part>> {
    if size == 0 {
        if part_size == 0 {
            return Err(TransferError::InvalidConfig(
                "Part size must be at least 1 byte".to_string(),
            ));
        }
        return Ok(Vec::new());
    }
    partition(0, size - 1, part_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn assert_covers(parts: &[Part], start: u64, end: u64, part_size: u64) {
        assert!(!parts.is_empty());
        assert_eq!(parts[0].start, start);
        assert_eq!(parts.last().unwrap().end, end);

        for (i, part) in parts.iter().enumerate() {
            assert_eq!(part.index, i);
            assert_eq!(part.number as usize, i + 1);
            assert_eq!(part.offset, start);
            assert!(part.len() >= 1);
            assert!(part.len() <= part_size);
            if i + 1 < parts.len() {
                assert_eq!(part.len(), part_size);
                assert_eq!(parts[i + 1].start, part.end + 1);
            }
        }
    }

    #[test]
    fn test_three_parts() {
        let parts = partition(0, 249, 100).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!((parts[0].index, parts[0].start, parts[0].end), (0, 0, 99));
        assert_eq!((parts[1].index, parts[1].start, parts[1].end), (1, 100, 199));
        assert_eq!((parts[2].index, parts[2].start, parts[2].end), (2, 200, 249));
        assert_eq!(parts[2].len(), 50);
    }

    #[test]
    fn test_single_byte_span() {
        let parts = partition(7, 7, 100).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].len(), 1);
    }

    #[test]
    fn test_part_size_larger_than_span() {
        let parts = partition(10, 19, 1000).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!((parts[0].start, parts[0].end), (10, 19));
    }

    #[test]
    fn test_exact_multiple() {
        let parts = partition(0, 299, 100).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 100);
    }

    #[test]
    fn test_ranged_span_offsets() {
        let parts = partition(1000, 1249, 100).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].relative_start(), 100);
        assert!(parts.iter().all(|p| p.offset == 1000));
    }

    #[test]
    fn test_span_at_u64_max() {
        let parts = partition(u64::MAX - 9, u64::MAX, 4).unwrap();
        assert_covers(&parts, u64::MAX - 9, u64::MAX, 4);
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn test_full_u64_span() {
        let err = partition(0, u64::MAX, 1 << 20).unwrap_err();
        assert!(matches!(err, TransferError::InvalidConfig(_)));

        let parts = partition(0, u64::MAX, 1 << 48).unwrap();
        assert_covers(&parts, 0, u64::MAX, 1 << 48);
        assert_eq!(parts.len(), 1 << 16);

        let parts = partition(0, u64::MAX, u64::MAX).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!((parts[1].start, parts[1].end), (u64::MAX, u64::MAX));
    }

    #[test]
    fn test_invalid_input() {
        assert!(matches!(
            partition(0, 10, 0),
            Err(TransferError::InvalidConfig(_))
        ));
        assert!(matches!(
            partition(11, 10, 5),
            Err(TransferError::InvalidRange(_))
        ));
    }

    #[test]
    fn test_partition_size() {
        assert!(partition_size(0, 100).unwrap().is_empty());
        assert!(partition_size(0, 0).is_err());
        assert_eq!(partition_size(250, 100).unwrap().len(), 3);
    }

    #[test]
    fn test_part_count() {
        assert_eq!(part_count(0, 100), 0);
        assert_eq!(part_count(1, 100), 1);
        assert_eq!(part_count(250, 100), 3);
        assert_eq!(part_count(300, 100), 3);
        assert_eq!(part_count(301, 100), 4);
    }

    #[test]
    fn test_byte_range_resolve() {
        assert_eq!(ByteRange::new(10, 19).resolve(100).unwrap(), Some((10, 19)));
        assert_eq!(ByteRange::new(10, 500).resolve(100).unwrap(), Some((10, 99)));
        assert_eq!(
            ByteRange::starting_at(40).resolve(100).unwrap(),
            Some((40, 99))
        );
        assert!(matches!(
            ByteRange::starting_at(101).resolve(100),
            Err(TransferError::InvalidRange(_))
        ));
        assert!(matches!(
            ByteRange { start: 20, end: Some(10) }.resolve(100),
            Err(TransferError::InvalidRange(_))
        ));
    }

    #[test]
    fn test_byte_range_resolve_empty() {
        assert_eq!(ByteRange::starting_at(100).resolve(100).unwrap(), None);
        assert_eq!(ByteRange::starting_at(0).resolve(0).unwrap(), None);
        assert_eq!(ByteRange::new(0, 10).resolve(0).unwrap(), None);
        assert!(ByteRange::starting_at(1).resolve(0).is_err());
    }

    #[test]
    fn test_byte_range_parse() {
        assert_eq!("5-9".parse::<ByteRange>().unwrap(), ByteRange::new(5, 9));
        assert_eq!("5-".parse::<ByteRange>().unwrap(), ByteRange::starting_at(5));
        assert!("9-5".parse::<ByteRange>().is_err());
        assert!("abc".parse::<ByteRange>().is_err());
        assert!("-5".parse::<ByteRange>().is_err());
    }

    #[test]
    fn test_coverage_random_spans() {
        let mut rng = rand::rng();
        for _ in 0..500 {
            let start = rng.random_range(0..10_000u64);
            let end = start + rng.random_range(0..5_000u64);
            let part_size = rng.random_range(1..700u64);

            let parts = partition(start, end, part_size).unwrap();
            assert_covers(&parts, start, end, part_size);
            assert_eq!(
                parts.len() as u64,
                part_count(end - start + 1, part_size)
            );
            assert_eq!(parts.iter().map(Part::len).sum::<u64>(), end - start + 1);
        }
    }
}
