//! A block-granularity read cache in front of a [crate::backend::Backend].
//!
//! # Sections
//!
//! Every [Request] is split into up to three [crate::split::Section]s. The prolog and epilog
//! are resolved against the pool:
//!
//! - **Hit**: the block is resident and the requested bytes are copied immediately.
//! - **In flight**: another section is already filling the block, so the section waits on that
//!   read rather than issuing a duplicate.
//! - **Miss**: the oldest block that is not in flight is recycled and a backend read is issued
//!   to fill it.
//! - **Delayed**: every block is in flight. The section is queued and retried on each call to
//!   [BlockCache::execute] until a block frees up.
//!
//! The main section is read straight into the caller's buffer without claiming a block.
//!
//! # Completion
//!
//! [BlockCache::prepare] returns a [futures::channel::oneshot::Receiver] that yields a
//! [Response] once every section of the request has delivered its bytes or failed. If any
//! section fails, the whole request fails, and the contents of the returned buffer must not
//! be trusted.
//!
//! # Backpressure
//!
//! [BlockCache::available_slots] reports how many more requests can be accepted before
//! sections start being delayed. Callers should throttle new requests accordingly.
//!
//! # Example
//!
//! ```rust
//! use commonware_blockcache::{
//!     backend::memory::Memory,
//!     cache::{BlockCache, Config, Request},
//! };
//! use prometheus_client::registry::Registry;
//!
//! // Create a backend holding a single file
//! let backend = Memory::default();
//! backend.insert("assets.pak", vec![7u8; 10_000]);
//!
//! // Create the cache
//! let mut registry = Registry::default();
//! let mut cache = BlockCache::init(&mut registry, backend, Config::default()).unwrap();
//!
//! // Read 50 bytes from the middle of the first block
//! let mut receiver = cache.prepare(Request::new("assets.pak", 100, 50));
//! let response = loop {
//!     if let Some(response) = receiver.try_recv().unwrap() {
//!         break response;
//!     }
//!     cache.execute();
//! };
//! assert!(response.result.is_ok());
//! assert_eq!(&response.buffer[..], &[7u8; 50]);
//!
//! // Reading from the same block again is served from the cache
//! let mut receiver = cache.prepare(Request::new("assets.pak", 200, 50));
//! assert!(receiver.try_recv().unwrap().is_some());
//! ```

use crate::Error;
use bytes::BytesMut;
use std::{num::NonZeroUsize, sync::Arc};

mod metrics;
mod storage;
pub use storage::BlockCache;

/// Configuration for a [BlockCache].
#[derive(Clone, Debug)]
pub struct Config {
    /// The size of each cached block. Must be a power of two.
    pub block_size: NonZeroUsize,

    /// The total number of bytes to dedicate to cached blocks. Any remainder after dividing by
    /// `block_size` is unused.
    pub cache_size: usize,

    /// Only epilogs claim blocks. Prologs are served from the cache when resident and are
    /// otherwise read along with the main section.
    pub only_epilog_writes: bool,

    /// The number of samples tracked by each rolling statistic.
    pub statistics_window: NonZeroUsize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: NonZeroUsize::new(64 * 1024).unwrap(),
            cache_size: 8 * 1024 * 1024,
            only_epilog_writes: false,
            statistics_window: NonZeroUsize::new(128).unwrap(),
        }
    }
}

/// A read of `buffer.len()` bytes at `offset` of the file at `path`.
#[derive(Debug)]
pub struct Request {
    pub path: Arc<str>,
    pub offset: u64,
    pub buffer: BytesMut,
}

impl Request {
    /// Create a request for `size` bytes, reading into a new zeroed buffer.
    pub fn new(path: impl Into<Arc<str>>, offset: u64, size: usize) -> Self {
        Self::with_buffer(path, offset, BytesMut::zeroed(size))
    }

    /// Create a request reading into `buffer`.
    pub fn with_buffer(path: impl Into<Arc<str>>, offset: u64, buffer: BytesMut) -> Self {
        Self {
            path: path.into(),
            offset,
            buffer,
        }
    }
}

/// The outcome of a [Request].
#[derive(Debug)]
pub struct Response {
    /// The caller's buffer. Only fully populated if `result` is `Ok`.
    pub buffer: BytesMut,

    /// Whether every section of the request was delivered.
    pub result: Result<(), Error>,
}

/// A snapshot of the cache's rolling statistics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Statistics {
    /// Percentage of recent cached sections found in the pool.
    pub hit_rate: f64,

    /// Percentage of recent requests that produced a prolog or epilog.
    pub cacheable_rate: f64,

    /// See [BlockCache::available_slots].
    pub available_slots: usize,
}
