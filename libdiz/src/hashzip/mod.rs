//! Content-addressed container: a ZIP container whose entries are indexed by
//! the SHA-256 of their uncompressed content.
//!
//! The `name -> hash` map is persisted as a JSON object in the trailer entry
//! [`HASHES_ENTRY`], written last.

mod reader;
mod writer;

pub use reader::HashZipReader;
pub use writer::{EntryWriter, HashZipWriter};

/// Reserved trailer entry holding the `name -> lowercase hex sha256` map.
pub const HASHES_ENTRY: &str = ".hashes";
