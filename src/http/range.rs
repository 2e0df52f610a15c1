// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

/// A single unit of a `Range: bytes=...` header, before it is checked
/// against the size of the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Range {
    /// `N-`: from `start` to the end of the resource.
    StartPointToEnd { start: u64 },

    /// `N-M`: both ends inclusive, as written in the header.
    Points {
        start: u64,
        end: u64,
    },

    /// `-N`: the last `suffix` bytes.
    Suffix { suffix: u64 },
}

impl Range {
    fn parse(unit: &str) -> Result<Self, RangeParseError> {
        if let Some(suffix) = unit.strip_prefix('-') {
            return Ok(Range::Suffix { suffix: parse_position(suffix)? });
        }

        let (start, end) = unit.split_once('-').ok_or(RangeParseError::Syntax)?;
        let start = parse_position(start)?;
        if end.is_empty() {
            Ok(Range::StartPointToEnd { start })
        } else {
            Ok(Range::Points { start, end: parse_position(end)? })
        }
    }

    /// Converts the unit into a half-open interval of the resource, or
    /// `None` if it doesn't fit inside `size` bytes.
    fn resolve(self, size: u64) -> Option<ByteRange> {
        let (start, end) = match self {
            Range::StartPointToEnd { start } => (start, size),
            Range::Points { start, end } => (start, end.checked_add(1)?),
            Range::Suffix { suffix } => (size.checked_sub(suffix)?, size),
        };

        if start > end || end > size {
            return None;
        }

        Some(ByteRange { start, end })
    }
}

fn parse_position(text: &str) -> Result<u64, RangeParseError> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeParseError::Syntax);
    }
    text.parse().map_err(|_| RangeParseError::Syntax)
}

/// A span of bytes in a resource, `start` inclusive and `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RangeParseError {
    /// The header isn't a comma-separated list of `N-M`, `N-` and `-N`.
    /// Answered with 400.
    Syntax,

    /// The syntax is fine, but one of the units doesn't fit the resource.
    /// The whole set is dropped and the full resource is sent.
    Unsatisfiable,
}

/// The validated intervals of a `Range` header, in header order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    /// Parses the part of a `Range` header after `bytes=` and checks every
    /// unit against `size`. Any failure invalidates the whole set, there is
    /// no per-unit filtering.
    pub fn parse(value: &str, size: u64) -> Result<Self, RangeParseError> {
        let units = value
            .split(',')
            .map(|unit| Range::parse(unit.trim()))
            .collect::<Result<Vec<_>, _>>()?;

        let ranges = units
            .into_iter()
            .map(|unit| unit.resolve(size))
            .collect::<Option<Vec<_>>>()
            .ok_or(RangeParseError::Unsatisfiable)?;

        Ok(Self { ranges })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Returns the first and only range if there is only one range.
    /// Otherwise, when there are more than one, returns `None`.
    #[must_use]
    pub fn first_and_only(&self) -> Option<ByteRange> {
        if self.ranges.len() == 1 {
            Some(self.ranges[0])
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ByteRange> {
        self.ranges.iter()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<ByteRange> {
        self.ranges.get(index).copied()
    }
}
