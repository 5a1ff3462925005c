//! Container image archives stored as deduplicated, content-addressed zip
//! files.
//!
//! The write path runs image bytes through [`compression::BlockCompressor`]
//! into a [`hashzip::HashZipWriter`]; the read path opens a
//! [`hashzip::HashZipReader`] and views it through [`archive::Archive`].

pub mod archive;
pub mod compression;
pub mod error;
pub mod hashzip;
pub mod reference;
pub mod source;
pub mod utils;
pub mod zip;

pub use error::{DizError, Result};
