use std::fmt;

/// A zero-based line/column position. Columns count bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line: u32, column: u32) -> Self {
        Position { line, column }
    }
}

/// A half-open source range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Location {
    pub begin: Position,
    pub end: Position,
}

impl Location {
    pub fn new(begin: Position, end: Position) -> Self {
        Location { begin, end }
    }

    /// Range covering both `self` and `other`.
    pub fn span(self, other: Location) -> Location {
        Location {
            begin: self.begin.min(other.begin),
            end: self.end.max(other.end),
        }
    }

    pub fn contains(&self, p: Position) -> bool {
        self.begin <= p && p < self.end
    }

    /// Zero-width location at `begin`.
    pub fn collapsed(self) -> Location {
        Location {
            begin: self.begin,
            end: self.begin,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}",
            self.begin.line + 1,
            self.begin.column + 1,
            self.end.line + 1,
            self.end.column + 1
        )
    }
}
