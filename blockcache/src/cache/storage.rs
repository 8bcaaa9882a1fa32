use super::{metrics::Metrics, Config, Request, Response, Statistics};
use crate::{
    backend::{Backend, Completed, ReadId},
    pool::Pool,
    split::{merge_prolog, split, Section},
    stats::Average,
    Error,
};
use bytes::BytesMut;
use futures::channel::oneshot;
use prometheus_client::registry::Registry;
use std::{
    collections::{hash_map::Entry, HashMap, VecDeque},
    sync::Arc,
};
use tracing::{debug, error, trace, warn};

/// Identifier of a caller's request while it is outstanding.
type RequestId = u64;

/// The caller's buffer, split around the region lent to the backend for a direct read.
struct Destination {
    head: BytesMut,
    main: Option<BytesMut>,
    tail: BytesMut,
    tail_start: usize,
}

impl Destination {
    /// Split `buffer` around `main`, returning the piece to lend to the backend.
    fn new(buffer: BytesMut, main: Option<&Section>) -> (Self, Option<BytesMut>) {
        let Some(main) = main else {
            let tail_start = buffer.len();
            return (
                Self {
                    head: buffer,
                    main: None,
                    tail: BytesMut::new(),
                    tail_start,
                },
                None,
            );
        };
        let mut head = buffer;
        let mut lent = head.split_off(main.output);
        let tail = lent.split_off(main.copy_size);
        let destination = Self {
            head,
            main: None,
            tail,
            tail_start: main.output + main.copy_size,
        };
        (destination, Some(lent))
    }

    /// The part of the caller's buffer `section` writes to.
    fn slice(&mut self, section: &Section) -> Result<&mut [u8], Error> {
        let range = section.destination();
        let out = if range.end <= self.head.len() {
            self.head.get_mut(range)
        } else if range.start >= self.tail_start {
            self.tail
                .get_mut(range.start - self.tail_start..range.end - self.tail_start)
        } else {
            None
        };
        out.ok_or(Error::Internal("section overlaps a direct read"))
    }

    /// Take back the piece lent to the backend.
    fn restore(&mut self, lent: BytesMut) {
        self.main = Some(lent);
    }

    /// Rejoin the pieces of the caller's buffer.
    fn into_buffer(self) -> BytesMut {
        let mut buffer = self.head;
        if let Some(main) = self.main {
            buffer.unsplit(main);
        }
        buffer.unsplit(self.tail);
        buffer
    }
}

/// A caller's request awaiting one or more sections.
struct Outstanding {
    destination: Destination,
    remaining: usize,
    error: Option<Error>,
    sender: oneshot::Sender<Response>,
}

/// A cached section of a request.
struct Pending {
    request: RequestId,
    path: Arc<str>,
    section: Section,
}

/// A backend read and everything waiting on it.
enum Fetch {
    /// A block read, delivering into every pending section once complete.
    Block { slot: usize, sections: Vec<Pending> },

    /// A main section read straight into the caller's buffer.
    Direct { request: RequestId },
}

/// The outcome of resolving a section against the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Resolution {
    /// Served from a resident block.
    Hit,
    /// Registered against an in-flight read.
    Queued,
    /// Every block is in flight.
    Delayed,
}

/// A read cache serving prologs and epilogs of requests from a fixed pool of blocks.
pub struct BlockCache<B: Backend> {
    backend: B,
    pool: Pool,
    only_epilog_writes: bool,

    next_request: RequestId,
    requests: HashMap<RequestId, Outstanding>,
    fetches: HashMap<ReadId, Fetch>,
    delayed: VecDeque<Pending>,
    in_flight: usize,

    hit_rate: Average,
    cacheable_rate: Average,
    metrics: Metrics,
}

impl<B: Backend> BlockCache<B> {
    /// Create a cache in front of `backend`, registering its metrics with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if the block size is not a power of two or the cache size cannot hold a
    /// single block.
    pub fn init(registry: &mut Registry, backend: B, cfg: Config) -> Result<Self, Error> {
        let block_size = cfg.block_size.get();
        if !block_size.is_power_of_two() {
            return Err(Error::InvalidBlockSize(block_size));
        }
        let pool = Pool::new(block_size, cfg.cache_size / block_size);
        if pool.is_empty() {
            return Err(Error::CacheTooSmall {
                cache_size: cfg.cache_size,
                block_size,
            });
        }
        debug!(block_size, blocks = pool.len(), "initialized block cache");

        Ok(Self {
            backend,
            pool,
            only_epilog_writes: cfg.only_epilog_writes,

            next_request: 0,
            requests: HashMap::new(),
            fetches: HashMap::new(),
            delayed: VecDeque::new(),
            in_flight: 0,

            hit_rate: Average::new(cfg.statistics_window),
            cacheable_rate: Average::new(cfg.statistics_window),
            metrics: Metrics::init(registry),
        })
    }

    /// Accept a read request.
    ///
    /// The returned receiver yields the caller's buffer once every section of the request has
    /// completed. Requests served entirely from resident blocks complete before this returns.
    pub fn prepare(&mut self, request: Request) -> oneshot::Receiver<Response> {
        let (sender, receiver) = oneshot::channel();
        let Request {
            path,
            offset,
            buffer,
        } = request;

        let block_size = self.pool.block_size();
        let split = match self
            .backend
            .size(&path)
            .map_err(|err| Error::FileSize(path.to_string(), Box::new(err)))
            .and_then(|file_size| split(offset, buffer.len(), file_size, block_size))
        {
            Ok(split) => split,
            Err(err) => {
                debug!(%path, offset, size = buffer.len(), ?err, "rejected request");
                let _ = sender.send(Response {
                    buffer,
                    result: Err(err),
                });
                return receiver;
            }
        };
        if split.is_empty() {
            let _ = sender.send(Response {
                buffer,
                result: Ok(()),
            });
            return receiver;
        }
        self.cacheable_rate.push(split.is_cacheable() as u64);
        if !split.is_cacheable() {
            self.metrics.bypassed.inc();
        }

        // Only epilogs claim blocks: a prolog is served from the pool if it happens to be
        // resident, and is otherwise read along with the main section.
        let mut prolog = split.prolog;
        let mut main = split.main;
        let epilog = split.epilog;
        if self.only_epilog_writes && (main.is_some() || epilog.is_some()) {
            if let Some(section) = prolog {
                if self.pool.find(&path, section.read_offset).is_none() {
                    self.hit_rate.push(0);
                    self.metrics.misses.inc();
                    match merge_prolog(&section, main.as_ref()) {
                        Ok(merged) => {
                            trace!(%path, offset, "merged prolog into direct read");
                            prolog = None;
                            main = Some(merged);
                        }
                        Err(err) => {
                            error!(%path, offset, ?err, "failed to merge prolog");
                            let _ = sender.send(Response {
                                buffer,
                                result: Err(err),
                            });
                            return receiver;
                        }
                    }
                }
            }
        }

        let id = self.next_request;
        self.next_request = self.next_request.wrapping_add(1);
        let (destination, lent) = Destination::new(buffer, main.as_ref());
        let remaining = prolog.iter().chain(main.iter()).chain(epilog.iter()).count();
        self.requests.insert(
            id,
            Outstanding {
                destination,
                remaining,
                error: None,
                sender,
            },
        );

        if let (Some(section), Some(lent)) = (main, lent) {
            let read = self
                .backend
                .read(&path, section.read_offset, section.read_size, lent);
            debug!(%path, offset = section.read_offset, size = section.read_size, read, "reading main section");
            self.fetches.insert(read, Fetch::Direct { request: id });
        }
        for section in prolog.into_iter().chain(epilog) {
            let pending = Pending {
                request: id,
                path: path.clone(),
                section,
            };
            self.resolve(pending, true);
        }
        receiver
    }

    /// Run a processing pass: retry delayed sections, drive the backend, and dispatch every
    /// finished read. Returns whether any work was done.
    pub fn execute(&mut self) -> bool {
        let retried = self.retry_delayed();
        let forwarded = self.backend.execute();
        let mut completed = false;
        while let Some(read) = self.backend.poll() {
            self.complete(read);
            completed = true;
        }
        retried || forwarded || completed
    }

    /// Invalidate every block holding data of `path`.
    pub fn flush(&mut self, path: &str) {
        let reset = self.pool.flush(path);
        debug!(path, reset, "flushed file from cache");
    }

    /// Invalidate every block.
    pub fn flush_all(&mut self) {
        let reset = self.pool.flush_all();
        debug!(reset, "flushed cache");
    }

    /// The number of new requests the cache can accept without delaying sections, clamped to
    /// the backend's own capacity.
    pub fn available_slots(&self) -> usize {
        let available = self
            .pool
            .len()
            .saturating_sub(self.in_flight)
            .saturating_sub(self.delayed.len());
        available.min(self.backend.available_slots())
    }

    /// Collect the rolling hit and cacheable rates along with the available slots.
    pub fn statistics(&self) -> Statistics {
        Statistics {
            hit_rate: self.hit_rate.average() * 100.0,
            cacheable_rate: self.cacheable_rate.average() * 100.0,
            available_slots: self.available_slots(),
        }
    }

    /// The number of block reads in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// The number of sections waiting for a block.
    pub fn delayed(&self) -> usize {
        self.delayed.len()
    }

    /// The number of requests that have not yet completed.
    pub fn outstanding(&self) -> usize {
        self.requests.len()
    }

    /// The backend the cache reads through.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Serve `pending` from the pool, register it against an in-flight read, fetch its block,
    /// or delay it if no block can be recycled.
    fn resolve(&mut self, pending: Pending, record: bool) -> Resolution {
        let section = pending.section;
        if let Some(slot) = self.pool.find(&pending.path, section.read_offset) {
            if record {
                self.hit_rate.push(1);
                self.metrics.hits.inc();
            }
            let Some(read) = self.pool.in_flight(slot) else {
                trace!(path = %pending.path, offset = section.read_offset, slot, "cache hit");
                self.pool.touch(slot);
                self.deliver(slot, &pending);
                return Resolution::Hit;
            };
            trace!(path = %pending.path, offset = section.read_offset, slot, read, "waiting on in-flight block");
            match self.fetches.get_mut(&read) {
                Some(Fetch::Block { sections, .. }) => sections.push(pending),
                _ => {
                    error!(slot, read, "in-flight block has no pending read");
                    self.fail(pending.request, Error::Internal("in-flight block has no read"));
                }
            }
            return Resolution::Queued;
        }
        if record {
            self.hit_rate.push(0);
            self.metrics.misses.inc();
        }

        let Some((slot, evicted)) = self.pool.recycle(&pending.path, section.read_offset) else {
            debug!(path = %pending.path, offset = section.read_offset, "no block available, delaying section");
            if record {
                self.metrics.delayed.inc();
            }
            self.delayed.push_back(pending);
            self.metrics.queued.set(self.delayed.len() as i64);
            return Resolution::Delayed;
        };
        if evicted.is_some() {
            self.metrics.evictions.inc();
        }

        let path = pending.path.clone();
        let backend = &mut self.backend;
        let lent = self.pool.lend(slot, section.read_size, |buffer| {
            backend.read(&path, section.read_offset, section.read_size, buffer)
        });
        match lent {
            Ok(read) => {
                debug!(%path, offset = section.read_offset, slot, read, "fetching block");
                self.in_flight += 1;
                self.metrics.in_flight.set(self.in_flight as i64);
                self.fetches.insert(
                    read,
                    Fetch::Block {
                        slot,
                        sections: vec![pending],
                    },
                );
            }
            Err(err) => {
                error!(%path, slot, ?err, "failed to lend block");
                self.fail(pending.request, err);
            }
        }
        Resolution::Queued
    }

    /// Retry every section delayed before this pass. Returns whether any were scheduled.
    fn retry_delayed(&mut self) -> bool {
        let mut progress = false;
        for _ in 0..self.delayed.len() {
            let Some(pending) = self.delayed.pop_front() else {
                break;
            };
            if self.resolve(pending, false) != Resolution::Delayed {
                progress = true;
            }
        }
        self.metrics.queued.set(self.delayed.len() as i64);
        progress
    }

    /// Dispatch a finished backend read.
    fn complete(&mut self, completed: Completed) {
        let Completed { id, buffer, result } = completed;
        let Some(fetch) = self.fetches.remove(&id) else {
            warn!(read = id, "completion for unknown read");
            return;
        };

        let (slot, sections) = match fetch {
            Fetch::Direct { request } => {
                let Some(outstanding) = self.requests.get_mut(&request) else {
                    error!(read = id, request, "direct read for unknown request");
                    return;
                };
                outstanding.destination.restore(buffer);
                match result {
                    Ok(()) => self.finish(request),
                    Err(err) => {
                        warn!(read = id, ?err, "direct read failed");
                        self.metrics.failed_reads.inc();
                        self.fail(request, err);
                    }
                }
                return;
            }
            Fetch::Block { slot, sections } => (slot, sections),
        };

        self.in_flight -= 1;
        self.metrics.in_flight.set(self.in_flight as i64);
        let restored = self.pool.restore(slot, buffer, result.is_ok());
        match (result, restored) {
            (Ok(()), Ok(())) => {
                debug!(read = id, slot, waiting = sections.len(), "block filled");
                for pending in &sections {
                    self.deliver(slot, pending);
                }
            }
            (Err(err), _) => {
                warn!(read = id, slot, ?err, "block read failed");
                self.metrics.failed_reads.inc();
                for pending in sections {
                    let err = Error::ReadFailed(
                        pending.path.to_string(),
                        pending.section.read_offset,
                    );
                    self.fail(pending.request, err);
                }
            }
            (Ok(()), Err(err)) => {
                error!(read = id, slot, ?err, "failed to restore block");
                for pending in sections {
                    self.fail(pending.request, Error::Internal("failed to restore block"));
                }
            }
        }
        if self.pool.discard_flushed(slot) {
            debug!(slot, "discarded block flushed while in flight");
        }
    }

    /// Copy the bytes of `pending` out of the block at `slot` and finish the section.
    fn deliver(&mut self, slot: usize, pending: &Pending) {
        let Some(outstanding) = self.requests.get_mut(&pending.request) else {
            error!(request = pending.request, "section for unknown request");
            return;
        };
        let copied = outstanding
            .destination
            .slice(&pending.section)
            .and_then(|out| self.pool.copy(slot, &pending.section, out));
        if let Err(err) = copied {
            error!(request = pending.request, slot, ?err, "failed to copy cached bytes");
            if outstanding.error.is_none() {
                outstanding.error = Some(err);
            }
        }
        self.finish(pending.request);
    }

    /// Record `err` against a request and finish one of its sections.
    fn fail(&mut self, request: RequestId, err: Error) {
        if let Some(outstanding) = self.requests.get_mut(&request) {
            if outstanding.error.is_none() {
                outstanding.error = Some(err);
            }
        }
        self.finish(request);
    }

    /// Finish one section of a request, responding once none remain.
    fn finish(&mut self, request: RequestId) {
        let Entry::Occupied(mut entry) = self.requests.entry(request) else {
            return;
        };
        let outstanding = entry.get_mut();
        outstanding.remaining -= 1;
        if outstanding.remaining > 0 {
            return;
        }

        let Outstanding {
            destination,
            error,
            sender,
            ..
        } = entry.remove();
        let result = match error {
            Some(err) => Err(err),
            None => Ok(()),
        };
        trace!(request, ok = result.is_ok(), "request complete");
        let _ = sender.send(Response {
            buffer: destination.into_buffer(),
            result,
        });
    }
}
