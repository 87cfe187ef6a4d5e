//! Open-file state.
//!
//! A `FileId` is a stable index into the cache's file table. The cache owns
//! every `FileState`; records in the pool refer back to their file through
//! the id only, never through a pointer, so the pool and the file table
//! cannot alias each other.

/// Handle to an open file. Valid from `Bcache::open` until `Bcache::close`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FileId(pub(crate) usize);

/// Whether a record load at or beyond the logical end of file is an error
/// or a request to materialize a fresh, fill-initialized record.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EofMode {
    Report,
    Ignore,
}

/// The kind of header-data unit the file is currently positioned at.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HduKind {
    /// Image extension; `bitpix` is the FITS pixel type code
    /// (8, 16, 32, 64, -32 or -64).
    Image { bitpix: i32 },
    AsciiTable,
    BinaryTable,
}

/// The cache's view of the current header-data unit, installed by whatever
/// navigates HDUs. Only `datastart`, `rowlength` and `numrows` are
/// interpreted here; everything else about an HDU is out of scope.
#[derive(Clone, Copy, Debug)]
pub struct Hdu {
    pub kind: HduKind,
    /// Byte offset of the start of the data unit.
    pub datastart: u64,
    /// Bytes per table row; unused for images.
    pub rowlength: u64,
    /// Rows currently in the table; grows when a write runs past it.
    pub numrows: u64,
}

impl Hdu {
    pub const fn image(bitpix: i32, datastart: u64) -> Self {
        Self {
            kind: HduKind::Image { bitpix },
            datastart,
            rowlength: 0,
            numrows: 0,
        }
    }

    pub const fn ascii_table(datastart: u64, rowlength: u64, numrows: u64) -> Self {
        Self {
            kind: HduKind::AsciiTable,
            datastart,
            rowlength,
            numrows,
        }
    }

    pub const fn binary_table(datastart: u64, rowlength: u64, numrows: u64) -> Self {
        Self {
            kind: HduKind::BinaryTable,
            datastart,
            rowlength,
            numrows,
        }
    }

    /// The byte a record is initialized with when it is materialized past
    /// the physical end of file. ASCII table data is blank-padded; every
    /// other HDU is zero-filled.
    pub(crate) fn fill(&self) -> u8 {
        match self.kind {
            HduKind::AsciiTable => b' ',
            _ => 0,
        }
    }
}

/// Per-file bookkeeping. Mutated by every cache operation on the file.
pub(crate) struct FileState<D> {
    pub(crate) disk: D,

    /// Logical byte cursor: where the next buffered read or write lands.
    pub(crate) bytepos: u64,

    /// Where the driver was last positioned. Lets the cache skip a seek
    /// when consecutive transfers are physically adjacent.
    pub(crate) io_pos: u64,

    /// Physical on-disk size, in bytes.
    pub(crate) filesize: u64,

    /// Logical size: extends past `filesize` by the records that exist
    /// only in the cache. Always a record multiple and `>= filesize`.
    pub(crate) logfilesize: u64,

    /// Slot holding this file's current record, if any. When set, the
    /// slot's owner is this file; the selector will not evict it to serve
    /// another file.
    pub(crate) curslot: Option<usize>,

    pub(crate) hdu: Hdu,
}
