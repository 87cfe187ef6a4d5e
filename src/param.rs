//! System-wide constants.

use static_assertions::const_assert;

/// Size of one logical record, in bytes. Every physical transfer made
/// through the record cache is a whole number of records.
pub const BSIZE: usize = 2880;

/// Size of the record cache: how many records can be held in memory at
/// once, across all open files.
pub const NBUF: usize = 40;

/// Open files per system. Each open file pins at most one record in the
/// cache, so `NBUF` files can be active without evicting pinned records.
pub const NFILE: usize = 300;

/// Transfers at least this large bypass the cache for the bulk of the
/// payload and go to the driver in a single call.
pub const DIRECT_CUTOFF: usize = 2 * BSIZE;

// A direct transfer must span at least one whole record past the one that
// is current when it starts.
const_assert!(DIRECT_CUTOFF >= 2 * BSIZE);
const_assert!(NBUF >= 2);
