//! Composite status codes for navigation queries
//!
//! A status combines one primary outcome (success, failure or in progress)
//! with any number of detail flags, mirroring how callers test the outcome
//! first and then inspect why a result is partial.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Result of a query: failures carry their status, successes carry a value
/// (which embeds its own status when detail flags are meaningful)
pub type QueryResult<T> = std::result::Result<T, Status>;

/// Bitmask status of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(u32);

impl Status {
    /// Operation failed
    pub const FAILURE: Status = Status(1 << 31);
    /// Operation succeeded
    pub const SUCCESS: Status = Status(1 << 30);
    /// Operation still in progress
    pub const IN_PROGRESS: Status = Status(1 << 29);

    /// Mask selecting the detail flags
    pub const DETAIL_MASK: u32 = 0x00ff_ffff;
    /// Input data is not recognized
    pub const WRONG_MAGIC: Status = Status(1 << 0);
    /// Input data is in the wrong version
    pub const WRONG_VERSION: Status = Status(1 << 1);
    /// Operation ran out of memory
    pub const OUT_OF_MEMORY: Status = Status(1 << 2);
    /// An input parameter was invalid
    pub const INVALID_PARAM: Status = Status(1 << 3);
    /// Result buffer was too small to store all results
    pub const BUFFER_TOO_SMALL: Status = Status(1 << 4);
    /// Query ran out of search nodes
    pub const OUT_OF_NODES: Status = Status(1 << 5);
    /// Query did not reach the end location, returning best guess
    pub const PARTIAL_RESULT: Status = Status(1 << 6);
    /// A tile has already been assigned to the given x,y coordinate
    pub const ALREADY_OCCUPIED: Status = Status(1 << 7);

    /// Creates a status from raw bits
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits
    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub fn is_success(&self) -> bool {
        self.0 & Self::SUCCESS.0 != 0
    }

    pub fn is_failure(&self) -> bool {
        self.0 & Self::FAILURE.0 != 0
    }

    pub fn is_in_progress(&self) -> bool {
        self.0 & Self::IN_PROGRESS.0 != 0
    }

    /// Checks a detail flag
    pub fn has_detail(&self, detail: Status) -> bool {
        self.0 & detail.0 & Self::DETAIL_MASK != 0
    }

    /// Only the detail flags
    pub fn detail(&self) -> Status {
        Status(self.0 & Self::DETAIL_MASK)
    }

    /// Converts into a [`QueryResult`], mapping failures to `Err`
    pub fn into_result<T>(self, value: T) -> QueryResult<T> {
        if self.is_failure() {
            Err(self)
        } else {
            Ok(value)
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::SUCCESS
    }
}

impl BitOr for Status {
    type Output = Status;

    fn bitor(self, rhs: Status) -> Status {
        Status(self.0 | rhs.0)
    }
}

impl BitOrAssign for Status {
    fn bitor_assign(&mut self, rhs: Status) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            write!(f, "Success")?;
        } else if self.is_failure() {
            write!(f, "Failure")?;
        } else if self.is_in_progress() {
            write!(f, "In Progress")?;
        } else {
            write!(f, "Unknown")?;
        }

        let names = [
            (Self::WRONG_MAGIC, "Wrong Magic"),
            (Self::WRONG_VERSION, "Wrong Version"),
            (Self::OUT_OF_MEMORY, "Out of Memory"),
            (Self::INVALID_PARAM, "Invalid Param"),
            (Self::BUFFER_TOO_SMALL, "Buffer Too Small"),
            (Self::OUT_OF_NODES, "Out of Nodes"),
            (Self::PARTIAL_RESULT, "Partial Result"),
            (Self::ALREADY_OCCUPIED, "Already Occupied"),
        ];
        let details: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.has_detail(*flag))
            .map(|(_, name)| *name)
            .collect();
        if !details.is_empty() {
            write!(f, " ({})", details.join(", "))?;
        }

        Ok(())
    }
}

impl std::error::Error for Status {}

impl From<Status> for navtile_common::Error {
    fn from(status: Status) -> Self {
        navtile_common::Error::Pathfinding(status.to_string())
    }
}
