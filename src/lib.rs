//! # Blocktable - Block-Based Sorted Table Files
//!
//! Blocktable writes and reads the immutable, sorted files an LSM-tree storage
//! engine keeps on disk. Keys and values are grouped into checksummed,
//! optionally compressed data blocks, located through an index and screened
//! by bloom filters.
//!
//! ## Architecture
//!
//! The crate consists of several components:
//!
//! - **Table builder**: Turns a sorted stream of entries into a table file
//! - **Table reader**: Point lookups and iteration over a table file
//! - **Index**: Binary search, hash prefix, or two-level partitioned index
//! - **Filters**: Block-based, full, or partitioned bloom filters
//! - **Block cache**: Shared LRU cache for uncompressed and compressed blocks
//! - **Persistent cache**: Optional second tier consulted before the file
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use blocktable::config::{ReadOptions, TableOptions};
//! use blocktable::sstable::{TableBuilder, TableReader};
//!
//! # fn main() -> Result<(), blocktable::Error> {
//! let options = TableOptions::default();
//!
//! // Write a table
//! let mut builder = TableBuilder::create("./table.sst", options.clone())?;
//! builder.add(b"key1", b"value1")?;
//! builder.add(b"key2", b"value2")?;
//! builder.finish()?;
//!
//! // Read it back
//! let reader = TableReader::open_path("./table.sst", options)?;
//! if let Some(value) = reader.get(&ReadOptions::default(), b"key1")? {
//!     println!("Found: {:?}", value);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod cache;
pub mod coding;
pub mod comparator;
pub mod compression;
pub mod config;
pub mod error;
pub mod file;
pub mod filter;
pub mod sstable;
pub mod statistics;

// Re-exports
pub use config::{ReadOptions, TableOptions};
pub use error::{Error, Result};
pub use sstable::{TableBuilder, TableReader};
