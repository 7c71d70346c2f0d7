//! Side-car indexes for tar archives.
//!
//! An index records, for every member of a tar archive, the block where the member starts, how
//! many blocks it spans and where that block lives in the (possibly compressed) byte stream.
//! With an index, selected members can be extracted by seeking straight to them instead of
//! reading the whole archive.

pub mod create;
pub mod deflate;
pub mod extract;
pub mod index;
pub mod matcher;
pub mod stream;
pub mod util;

/// Size of a tar block.  Every offset and length in the index is counted in these units.
pub const TAR_BLOCK_SIZE: usize = 512;

/// The newest index format revision this crate reads and the one it writes.
pub const CURRENT_VERSION: u32 = 2;

/// Index path used when neither `-f` nor `$TARIX_OUTFILE` are given.
pub const DEFAULT_INDEX_FILE: &str = "out.tarix";
