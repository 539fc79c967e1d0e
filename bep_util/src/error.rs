use std::error::Error;
use std::fmt;

/// Result type for a LengthError.
pub type LengthResult<T> = Result<T, LengthError>;

/// Enumerates a set of length related errors.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum LengthErrorKind {
    /// Length exceeded an expected size.
    LengthExceeded,
    /// Length is not equal to an expected size.
    LengthExpected,
    /// Length is not a multiple of an expected size.
    LengthMultipleExpected,
}

/// Generic length error for various types.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct LengthError {
    kind: LengthErrorKind,
    length: usize,
    index: Option<usize>,
}

impl LengthError {
    /// Create a LengthError.
    pub fn new(kind: LengthErrorKind, length: usize) -> LengthError {
        LengthError { kind, length, index: None }
    }

    /// Create a LengthError for a given element index.
    pub fn with_index(kind: LengthErrorKind, length: usize, index: usize) -> LengthError {
        LengthError { kind, length, index: Some(index) }
    }

    /// Error is with this length or multiple of this length.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Error is for the element at this index.
    pub fn index(&self) -> Option<usize> {
        self.index
    }
}

impl fmt::Display for LengthError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            LengthErrorKind::LengthExceeded => write!(f, "Length Exceeded {}", self.length),
            LengthErrorKind::LengthExpected => write!(f, "Length Expected {}", self.length),
            LengthErrorKind::LengthMultipleExpected => {
                write!(f, "Length Multiple Of {} Expected", self.length)
            }
        }
    }
}

impl Error for LengthError {
    fn description(&self) -> &str {
        "Length Check Failed"
    }
}
