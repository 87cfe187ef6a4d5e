//! Error kinds surfaced by the record cache.
//!
//! Every fallible operation returns `Result<T>`; the first error aborts the
//! operation and is propagated unchanged to the caller. Nothing is retried
//! or recovered internally. A failed writeback leaves the record dirty and
//! still associated with its file, so the caller may retry.

use core::fmt;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Seek to a negative byte position.
    NegFilePos,
    /// Load of a record at or beyond the logical end of file, while the
    /// caller asked for end-of-file reporting.
    EndOfFile,
    /// No cache slot could be assigned, or the file table is full.
    TooManyFiles,
    /// Row number is not positive, or a read runs past the last table row.
    BadRowNum,
    /// Element (byte-within-row) number is not positive.
    BadElemNum,
    /// Transfer geometry does not match the supplied buffer.
    BadDimen,
    /// The file handle does not name an open file.
    BadHandle,
    /// The storage driver reported a failure; the message is the driver's.
    Io(&'static str),
}

impl Error {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NegFilePos => "negative file position",
            Self::EndOfFile => "read past logical end of file",
            Self::TooManyFiles => "too many open files",
            Self::BadRowNum => "bad table row number",
            Self::BadElemNum => "bad table element number",
            Self::BadDimen => "transfer geometry does not match buffer",
            Self::BadHandle => "stale or invalid file handle",
            Self::Io(msg) => msg,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub type Result<T> = core::result::Result<T, Error>;
