//! A [Backend] reading files beneath a directory on the local filesystem.
//!
//! Reads are queued by [Backend::read] and performed with blocking I/O on the next call to
//! [Backend::execute].

use super::{Backend, Completed, ReadId};
use crate::Error;
use bytes::BytesMut;
use std::{
    collections::{HashMap, VecDeque},
    fs::File,
    io::{Read, Seek, SeekFrom},
    num::NonZeroUsize,
    path::PathBuf,
};
use tracing::debug;

/// Configuration for a [Disk] backend.
#[derive(Clone, Debug)]
pub struct Config {
    /// The directory every requested path is resolved against.
    pub directory: PathBuf,

    /// The maximum number of reads queued at once.
    pub slots: usize,

    /// The maximum number of file handles kept open. The least recently opened handle is closed
    /// to make room for a new one.
    pub max_open_files: NonZeroUsize,
}

impl Config {
    pub const fn new(directory: PathBuf, slots: usize, max_open_files: NonZeroUsize) -> Self {
        Self {
            directory,
            slots,
            max_open_files,
        }
    }
}

struct Queued {
    id: ReadId,
    path: String,
    offset: u64,
    len: usize,
    buffer: BytesMut,
}

/// Files on the local filesystem.
pub struct Disk {
    cfg: Config,
    files: HashMap<String, File>,
    opened: VecDeque<String>,
    queued: VecDeque<Queued>,
    completed: VecDeque<Completed>,
    next_id: ReadId,
}

impl Disk {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            files: HashMap::new(),
            opened: VecDeque::new(),
            queued: VecDeque::new(),
            completed: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Return the open handle for `path`, opening it if needed.
    fn open(&mut self, path: &str) -> Result<&mut File, Error> {
        if !self.files.contains_key(path) {
            let file = File::open(self.cfg.directory.join(path)).map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    Error::FileMissing(path.into())
                } else {
                    Error::Io(err)
                }
            })?;
            if self.files.len() >= self.cfg.max_open_files.get() {
                if let Some(oldest) = self.opened.pop_front() {
                    self.files.remove(&oldest);
                    debug!(path = %oldest, "closed file");
                }
            }
            debug!(path, "opened file");
            self.files.insert(path.into(), file);
            self.opened.push_back(path.into());
        }
        self.files
            .get_mut(path)
            .ok_or(Error::Internal("file handle missing after open"))
    }

    /// Close the handle for `path`, if open. It is reopened by the next access.
    pub fn close(&mut self, path: &str) {
        if self.files.remove(path).is_some() {
            self.opened.retain(|opened| opened != path);
        }
    }

    /// The number of file handles currently open.
    pub fn open_files(&self) -> usize {
        self.files.len()
    }

    fn read_into(&mut self, queued: &mut Queued) -> Result<(), Error> {
        let Some(destination) = queued.buffer.get_mut(..queued.len) else {
            return Err(Error::ReadFailed(queued.path.clone(), queued.offset));
        };
        let file = self.open(&queued.path)?;
        file.seek(SeekFrom::Start(queued.offset))?;
        file.read_exact(destination)?;
        Ok(())
    }
}

impl Backend for Disk {
    fn size(&mut self, path: &str) -> Result<u64, Error> {
        Ok(self.open(path)?.metadata()?.len())
    }

    fn read(&mut self, path: &str, offset: u64, len: usize, buffer: BytesMut) -> ReadId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.queued.push_back(Queued {
            id,
            path: path.into(),
            offset,
            len,
            buffer,
        });
        id
    }

    fn execute(&mut self) -> bool {
        if self.queued.is_empty() {
            return false;
        }
        while let Some(mut queued) = self.queued.pop_front() {
            let result = self.read_into(&mut queued);
            self.completed.push_back(Completed {
                id: queued.id,
                buffer: queued.buffer,
                result,
            });
        }
        true
    }

    fn poll(&mut self) -> Option<Completed> {
        self.completed.pop_front()
    }

    fn available_slots(&self) -> usize {
        self.cfg.slots.saturating_sub(self.queued.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::{env, fs};

    #[test_traced]
    fn test_disk_read() {
        let mut rng = StdRng::from_entropy();
        let directory = env::temp_dir().join(format!("blockcache_disk_{}", rng.gen::<u64>()));
        fs::create_dir_all(&directory).unwrap();
        fs::write(directory.join("file"), (0..200u8).collect::<Vec<_>>()).unwrap();
        let mut disk = Disk::new(Config::new(
            directory.clone(),
            2,
            NonZeroUsize::new(4).unwrap(),
        ));

        assert_eq!(disk.size("file").unwrap(), 200);
        assert!(matches!(disk.size("missing"), Err(Error::FileMissing(_))));

        let ok = disk.read("file", 100, 4, BytesMut::zeroed(8));
        let short = disk.read("file", 198, 4, BytesMut::zeroed(4));
        let missing = disk.read("missing", 0, 4, BytesMut::zeroed(4));
        assert_eq!(disk.available_slots(), 0);
        assert!(disk.poll().is_none());

        assert!(disk.execute());
        let completed = disk.poll().unwrap();
        assert_eq!(completed.id, ok);
        completed.result.unwrap();
        assert_eq!(&completed.buffer[..4], &[100, 101, 102, 103]);
        assert_eq!(completed.buffer.len(), 8);

        let completed = disk.poll().unwrap();
        assert_eq!(completed.id, short);
        assert!(matches!(completed.result, Err(Error::Io(_))));

        let completed = disk.poll().unwrap();
        assert_eq!(completed.id, missing);
        assert!(matches!(completed.result, Err(Error::FileMissing(_))));
        assert_eq!(disk.available_slots(), 2);

        fs::remove_dir_all(directory).unwrap();
    }

    #[test_traced]
    fn test_disk_bounds_open_files() {
        let mut rng = StdRng::from_entropy();
        let directory = env::temp_dir().join(format!("blockcache_disk_{}", rng.gen::<u64>()));
        fs::create_dir_all(&directory).unwrap();
        for name in ["a", "b", "c"] {
            fs::write(directory.join(name), name.repeat(10)).unwrap();
        }
        let mut disk = Disk::new(Config::new(
            directory.clone(),
            8,
            NonZeroUsize::new(2).unwrap(),
        ));

        // Opening a third file closes the first.
        for name in ["a", "b", "c"] {
            assert_eq!(disk.size(name).unwrap(), 10);
        }
        assert_eq!(disk.open_files(), 2);

        // Closed files are reopened on demand.
        let id = disk.read("a", 2, 3, BytesMut::zeroed(3));
        assert!(disk.execute());
        let completed = disk.poll().unwrap();
        assert_eq!(completed.id, id);
        completed.result.unwrap();
        assert_eq!(&completed.buffer[..], b"aaa");
        assert_eq!(disk.open_files(), 2);

        disk.close("a");
        disk.close("missing");
        assert_eq!(disk.open_files(), 1);

        fs::remove_dir_all(directory).unwrap();
    }
}
