//! Decompose a read of an arbitrary byte range into block-aligned [Section]s.
//!
//! A request for `[offset, offset + size)` is split into at most three sections:
//!
//! - a _prolog_ covering the block that contains an unaligned `offset`,
//! - a _main_ section covering the aligned middle of the request, and
//! - an _epilog_ covering the block that contains an unaligned `offset + size`.
//!
//! The prolog and epilog always read a whole block (clamped to the end of the file) so that the
//! block can be cached, and copy only the requested bytes into the caller's buffer. The main
//! section is read directly into the caller's buffer.
//!
//! Requests that are aligned on both ends, or that read through the end of the file from an
//! aligned offset, produce only a main section and never touch the cache.

use crate::Error;
use std::ops::Range;
use tracing::error;

/// One block-aligned portion of a caller's read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Section {
    /// The file offset to read from the backend.
    pub read_offset: u64,

    /// The number of bytes to read from the backend.
    pub read_size: usize,

    /// The offset within the fetched bytes where the requested bytes begin.
    pub block_offset: usize,

    /// The offset within the caller's buffer where the requested bytes are copied to.
    pub output: usize,

    /// The number of bytes copied into the caller's buffer.
    pub copy_size: usize,
}

impl Section {
    /// A section that reads exactly the bytes it delivers.
    pub const fn direct(read_offset: u64, size: usize, output: usize) -> Self {
        Self {
            read_offset,
            read_size: size,
            block_offset: 0,
            output,
            copy_size: size,
        }
    }

    /// The range of the file delivered into the caller's buffer.
    pub fn source(&self) -> Range<u64> {
        let start = self.read_offset + self.block_offset as u64;
        start..start + self.copy_size as u64
    }

    /// The range of the caller's buffer this section writes to.
    pub fn destination(&self) -> Range<usize> {
        self.output..self.output + self.copy_size
    }
}

/// The sections produced for a single request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Split {
    pub prolog: Option<Section>,
    pub main: Option<Section>,
    pub epilog: Option<Section>,
}

impl Split {
    /// Whether any section of this split is served through the cache.
    pub fn is_cacheable(&self) -> bool {
        self.prolog.is_some() || self.epilog.is_some()
    }

    /// The number of sections in use.
    pub fn len(&self) -> usize {
        self.sections().count()
    }

    /// Whether the split has no sections (a zero-length request).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over the sections in use, in file order.
    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.prolog
            .iter()
            .chain(self.main.iter())
            .chain(self.epilog.iter())
    }
}

/// Split a read of `size` bytes at `offset` of a file that is `file_size` bytes long.
///
/// # Errors
///
/// Returns [Error::InvalidBlockSize] if `block_size` is not a power of two and
/// [Error::InvalidRange] if the request does not lie within the file.
pub fn split(offset: u64, size: usize, file_size: u64, block_size: usize) -> Result<Split, Error> {
    if !block_size.is_power_of_two() {
        return Err(Error::InvalidBlockSize(block_size));
    }
    let invalid = || Error::InvalidRange {
        offset,
        size: size as u64,
        file_size,
    };
    let end = offset.checked_add(size as u64).ok_or_else(invalid)?;
    if end > file_size {
        return Err(invalid());
    }

    let mut split = Split::default();
    if size == 0 {
        return Ok(split);
    }

    let block = block_size as u64;
    let mask = !(block - 1);
    let block_read_size = |start: u64| block.min(file_size - start) as usize;

    // The portion of the request not yet covered by a cached section.
    let mut main_offset = offset;
    let mut main_output = 0;
    let mut remaining = size;

    let rounded_start = offset & mask;
    if rounded_start == offset {
        // Nothing follows the request, so there is nothing worth caching.
        if end == file_size {
            split.main = Some(Section::direct(offset, size, 0));
            return Ok(split);
        }

        // Cache the whole block even though only its head is wanted.
        if size < block_size {
            split.prolog = Some(Section {
                read_offset: offset,
                read_size: block_read_size(offset),
                block_offset: 0,
                output: 0,
                copy_size: size,
            });
            return Ok(split);
        }
    } else {
        let block_offset = (offset - rounded_start) as usize;
        let read_size = block_read_size(rounded_start);
        let mut prolog = Section {
            read_offset: rounded_start,
            read_size,
            block_offset,
            output: 0,
            copy_size: size,
        };
        if block_offset + size <= read_size {
            split.prolog = Some(prolog);
            return Ok(split);
        }
        prolog.copy_size = read_size - block_offset;
        split.prolog = Some(prolog);

        main_offset += prolog.copy_size as u64;
        main_output += prolog.copy_size;
        remaining -= prolog.copy_size;
    }

    let rounded_end = end & mask;
    let tail = (end - rounded_end) as usize;
    if tail != 0 {
        let read_size = block_read_size(rounded_end);
        if tail < read_size {
            split.epilog = Some(Section {
                read_offset: rounded_end,
                read_size,
                block_offset: 0,
                output: (rounded_end - offset) as usize,
                copy_size: tail,
            });
            remaining -= tail;
        }
    }

    if remaining != 0 {
        if main_offset & !mask != 0 {
            error!(offset, size, main_offset, "main section is not block aligned");
            return Err(Error::Internal("main section is not block aligned"));
        }
        split.main = Some(Section::direct(main_offset, remaining, main_output));
    }
    Ok(split)
}

/// Fold a prolog into the direct read that follows it.
///
/// The returned section reads the prolog's requested bytes and (if present) the main section's
/// bytes in a single direct read, without claiming a cache block.
pub fn merge_prolog(prolog: &Section, main: Option<&Section>) -> Result<Section, Error> {
    let source = prolog.source();
    let Some(main) = main else {
        return Ok(Section::direct(source.start, prolog.copy_size, prolog.output));
    };
    if main.read_offset != source.end || main.output != prolog.destination().end {
        return Err(Error::Internal("prolog does not precede main section"));
    }
    Ok(Section::direct(
        source.start,
        prolog.copy_size + main.copy_size,
        prolog.output,
    ))
}
