use spm_wire::rule::CodecError;
use thiserror::Error;

/// Which allocation failed while building a table update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// A rule node or its precedence bucket.
    Node,
    /// The identifier index.
    Index,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error("Rule table is full ({capacity} rules)")]
    TableFull { capacity: usize },
    #[error("Rule table is empty")]
    TableEmpty,
    #[error("Allocation failed: {0:?}")]
    AllocFailed(Allocation),
    #[error("No rule with id {0}")]
    RuleNotFound(u32),
    #[error("Unknown add/remove command {0}")]
    UnknownCommand(u8),
    #[error("Another rule update is in progress")]
    WriterBusy,
    #[error("Invalid rule output {0} (valid range: 0-9)")]
    InvalidOutput(u16),
    #[error("Rule update carries no rule")]
    NullRule,
    #[error("Malformed rule payload: {0}")]
    Codec(#[from] CodecError),
}

impl UpdateError {
    /// Returns the control-plane result code for this error.
    pub const fn code(&self) -> ResultCode {
        match self {
            Self::TableFull { .. } => ResultCode::ErrTableFull,
            Self::TableEmpty => ResultCode::ErrTableEmpty,
            Self::AllocFailed(Allocation::Node) => ResultCode::ErrAllocNode,
            Self::AllocFailed(Allocation::Index) => ResultCode::ErrAllocHash,
            Self::RuleNotFound(_) => ResultCode::ErrRuleNotFound,
            Self::UnknownCommand(_) => ResultCode::ErrUnknownCommand,
            Self::WriterBusy => ResultCode::ErrSingleWriter,
            Self::InvalidOutput(_) | Self::Codec(_) => ResultCode::ErrInvalidEntry,
            Self::NullRule => ResultCode::ErrNullRule,
        }
    }
}

/// The successful result of a rule update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Added,
    Deleted,
    Modified,
}

impl UpdateOutcome {
    pub const fn code(&self) -> ResultCode {
        match self {
            Self::Added => ResultCode::SuccessAdd,
            Self::Deleted => ResultCode::SuccessDelete,
            Self::Modified => ResultCode::SuccessModify,
        }
    }
}

/// Numeric update result codes exchanged with the control plane. Values below
/// [`ResultCode::Err`] are errors, values above it are successes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResultCode {
    ErrTableFull = 0,
    ErrTableEmpty = 1,
    ErrAllocNode = 2,
    ErrAllocHash = 3,
    ErrRuleNotFound = 4,
    ErrUnknownCommand = 5,
    ErrSingleWriter = 6,
    ErrInvalidEntry = 7,
    ErrNullRule = 8,
    Err = 9,
    SuccessAdd = 10,
    SuccessDelete = 11,
    SuccessModify = 12,
}

impl ResultCode {
    #[inline]
    pub fn is_success(self) -> bool {
        self > Self::Err
    }
}

impl From<&Result<UpdateOutcome, UpdateError>> for ResultCode {
    fn from(result: &Result<UpdateOutcome, UpdateError>) -> Self {
        match result {
            Ok(outcome) => outcome.code(),
            Err(e) => e.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_control_plane_values() {
        assert_eq!(UpdateError::TableFull { capacity: 255 }.code() as u8, 0);
        assert_eq!(UpdateError::AllocFailed(Allocation::Index).code() as u8, 3);
        assert_eq!(UpdateError::WriterBusy.code() as u8, 6);
        assert_eq!(UpdateError::NullRule.code() as u8, 8);
        assert_eq!(UpdateOutcome::Modified.code() as u8, 12);

        assert!(!UpdateError::RuleNotFound(1).code().is_success());
        assert!(UpdateOutcome::Deleted.code().is_success());
    }
}
