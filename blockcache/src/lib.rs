//! Serve unaligned file reads from a fixed pool of cached blocks.
//!
//! A [cache::BlockCache] sits in front of a [backend::Backend] and decomposes every read into up
//! to three [split::Section]s: an unaligned leading prolog, an aligned main region, and an
//! unaligned trailing epilog. The prolog and epilog are served from (or fetched into) a fixed
//! [pool::Pool] of block-sized slots. The main region gains nothing from caching and is read
//! straight into the caller's buffer.
//!
//! # Status
//!
//! `commonware-blockcache` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use thiserror::Error;

pub mod backend;
pub mod cache;
pub mod pool;
pub mod split;
pub mod stats;

/// Errors that can occur when interacting with the cache or its backend.
#[derive(Debug, Error)]
pub enum Error {
    #[error("block size must be a non-zero power of two: {0}")]
    InvalidBlockSize(usize),
    #[error("cache size {cache_size} cannot hold a single block of {block_size} bytes")]
    CacheTooSmall { cache_size: usize, block_size: usize },
    #[error("invalid range: offset={offset} size={size} file_size={file_size}")]
    InvalidRange {
        offset: u64,
        size: u64,
        file_size: u64,
    },
    #[error("file size unavailable: {0}: {1}")]
    FileSize(String, Box<Error>),
    #[error("file missing: {0}")]
    FileMissing(String),
    #[error("read failed: {0} at {1}")]
    ReadFailed(String, u64),
    #[error("internal error: {0}")]
    Internal(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
