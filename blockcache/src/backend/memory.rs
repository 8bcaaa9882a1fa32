//! An in-memory [Backend] whose reads complete only when it is driven.
//!
//! Cloning a [Memory] returns a handle to the same files and queue, so a caller can hand one
//! clone to a [crate::cache::BlockCache] and keep another to add files, inject failures, or
//! control when reads complete.

use super::{Backend, Completed, ReadId};
use crate::Error;
use bytes::BytesMut;
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{Arc, Mutex},
};

/// The default number of reads a [Memory] backend accepts concurrently.
const DEFAULT_SLOTS: usize = 1024;

struct Queued {
    id: ReadId,
    path: String,
    offset: u64,
    len: usize,
    buffer: BytesMut,
}

struct State {
    files: BTreeMap<String, Vec<u8>>,
    queued: VecDeque<Queued>,
    completed: VecDeque<Completed>,
    failures: BTreeSet<(String, u64)>,
    next_id: ReadId,
    issued: u64,
    paused: bool,
    slots: usize,
}

impl State {
    fn finish(&mut self, queued: Queued) {
        let Queued {
            id,
            path,
            offset,
            len,
            mut buffer,
        } = queued;
        let result = if self.failures.contains(&(path.clone(), offset)) {
            Err(Error::ReadFailed(path, offset))
        } else {
            match self.files.get(&path) {
                None => Err(Error::FileMissing(path)),
                Some(data) => {
                    let range = usize::try_from(offset)
                        .ok()
                        .and_then(|start| Some(start..start.checked_add(len)?));
                    match range.and_then(|range| data.get(range)) {
                        Some(bytes) if len <= buffer.len() => {
                            buffer[..len].copy_from_slice(bytes);
                            Ok(())
                        }
                        _ => Err(Error::ReadFailed(path, offset)),
                    }
                }
            }
        };
        self.completed.push_back(Completed { id, buffer, result });
    }
}

/// In-memory files read through a manually driven queue.
#[derive(Clone)]
pub struct Memory {
    state: Arc<Mutex<State>>,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new(DEFAULT_SLOTS)
    }
}

impl Memory {
    /// Create an empty backend that accepts up to `slots` concurrent reads.
    pub fn new(slots: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                files: BTreeMap::new(),
                queued: VecDeque::new(),
                completed: VecDeque::new(),
                failures: BTreeSet::new(),
                next_id: 0,
                issued: 0,
                paused: false,
                slots,
            })),
        }
    }

    /// Create (or replace) the file at `path`.
    pub fn insert(&self, path: &str, data: impl Into<Vec<u8>>) {
        let mut state = self.state.lock().unwrap();
        state.files.insert(path.into(), data.into());
    }

    /// Remove the file at `path`.
    pub fn remove(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        state.files.remove(path);
    }

    /// Fail every future read that starts at `offset` of `path`.
    pub fn fail(&self, path: &str, offset: u64) {
        let mut state = self.state.lock().unwrap();
        state.failures.insert((path.into(), offset));
    }

    /// Stop failing reads that start at `offset` of `path`.
    pub fn heal(&self, path: &str, offset: u64) {
        let mut state = self.state.lock().unwrap();
        state.failures.remove(&(path.to_string(), offset));
    }

    /// While paused, [Backend::execute] completes nothing.
    pub fn pause(&self, paused: bool) {
        let mut state = self.state.lock().unwrap();
        state.paused = paused;
    }

    /// Complete the oldest queued read, even if paused. Returns whether a read was completed.
    pub fn complete_next(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(queued) = state.queued.pop_front() else {
            return false;
        };
        state.finish(queued);
        true
    }

    /// The total number of reads issued.
    pub fn issued(&self) -> u64 {
        self.state.lock().unwrap().issued
    }

    /// The number of reads issued but not yet completed.
    pub fn outstanding(&self) -> usize {
        self.state.lock().unwrap().queued.len()
    }
}

impl Backend for Memory {
    fn size(&mut self, path: &str) -> Result<u64, Error> {
        let state = self.state.lock().unwrap();
        state
            .files
            .get(path)
            .map(|data| data.len() as u64)
            .ok_or_else(|| Error::FileMissing(path.into()))
    }

    fn read(&mut self, path: &str, offset: u64, len: usize, buffer: BytesMut) -> ReadId {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id = state.next_id.wrapping_add(1);
        state.issued += 1;
        state.queued.push_back(Queued {
            id,
            path: path.into(),
            offset,
            len,
            buffer,
        });
        id
    }

    fn execute(&mut self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.paused || state.queued.is_empty() {
            return false;
        }
        while let Some(queued) = state.queued.pop_front() {
            state.finish(queued);
        }
        true
    }

    fn poll(&mut self) -> Option<Completed> {
        self.state.lock().unwrap().completed.pop_front()
    }

    fn available_slots(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.slots.saturating_sub(state.queued.len())
    }
}
