//! The file interface a [crate::cache::BlockCache] reads through.
//!
//! Reads are asynchronous: [Backend::read] takes ownership of the destination buffer and returns
//! immediately with a [ReadId]. The buffer is handed back, filled or not, in a [Completed] once
//! [Backend::poll] reports the read as finished. Every call happens on the thread driving the
//! cache, so implementations need no internal synchronization for the cache's sake.

use crate::Error;
use bytes::BytesMut;

pub mod disk;
pub mod memory;

/// Unique identifier for a read issued to a [Backend].
///
/// Once u64 reads have been issued, the ID wraps around (resetting to zero). As long as there
/// are less than u64 reads outstanding, this should not be an issue.
pub type ReadId = u64;

/// A finished read.
#[derive(Debug)]
pub struct Completed {
    /// The read that finished.
    pub id: ReadId,

    /// The buffer passed to [Backend::read].
    pub buffer: BytesMut,

    /// Whether the requested bytes were written into `buffer`.
    pub result: Result<(), Error>,
}

/// Interface that any file source must implement to sit behind the cache.
pub trait Backend {
    /// Return the length of the file at `path`.
    fn size(&mut self, path: &str) -> Result<u64, Error>;

    /// Read `len` bytes at `offset` of `path` into the front of `buffer`.
    ///
    /// `buffer` is at least `len` bytes long and must be returned, unresized, in the
    /// [Completed] for this read.
    fn read(&mut self, path: &str, offset: u64, len: usize, buffer: BytesMut) -> ReadId;

    /// Make progress on outstanding reads. Returns whether any work was done.
    fn execute(&mut self) -> bool;

    /// Take the next finished read, if any.
    fn poll(&mut self) -> Option<Completed>;

    /// The number of additional reads the backend is willing to accept.
    fn available_slots(&self) -> usize;
}
