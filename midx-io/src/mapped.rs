//! A file's content, held either as an mmap region or as a heap-backed
//! copy. Every on-disk structure in this workspace (main index, log,
//! cache) is read through one of these so growth and remapping logic
//! lives in exactly one place.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use memmap2::MmapMut;

/// Either an mmap'd region or a plain in-memory buffer backing a file.
///
/// The heap variant exists for filesystems or configurations where mmap is
/// unsafe or unavailable (see [`crate::nfs::NfsPolicy`]): the whole file is
/// read into memory and writes go through `pwrite`-style calls on the
/// originating `File` instead of being reflected directly into the buffer.
pub enum MappedFile {
    Mmap(MmapMut),
    Heap(Vec<u8>),
}

impl MappedFile {
    /// Map `file` into memory. The file must already have a non-zero size;
    /// callers that need an initial size should `set_len` first.
    pub fn open_mmap(file: &File) -> io::Result<Self> {
        let mmap = unsafe { MmapMut::map_mut(file)? };
        Ok(MappedFile::Mmap(mmap))
    }

    /// Read the whole file into a heap buffer instead of mapping it.
    pub fn open_heap(file: &mut File) -> io::Result<Self> {
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(MappedFile::Heap(buf))
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            MappedFile::Mmap(m) => &m[..],
            MappedFile::Heap(v) => &v[..],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            MappedFile::Mmap(m) => &mut m[..],
            MappedFile::Heap(v) => &mut v[..],
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grow the backing storage to `new_len` bytes, zero-filling the
    /// extension. For the mmap variant this `ftruncate`s the file and
    /// remaps; for the heap variant it extends the in-memory buffer (the
    /// caller is responsible for keeping the file itself in sync via
    /// ordinary writes).
    pub fn grow(&mut self, file: &File, new_len: u64) -> io::Result<()> {
        match self {
            MappedFile::Mmap(_) => {
                file.set_len(new_len)?;
                let mmap = unsafe { MmapMut::map_mut(file)? };
                *self = MappedFile::Mmap(mmap);
                Ok(())
            }
            MappedFile::Heap(v) => {
                v.resize(new_len as usize, 0);
                Ok(())
            }
        }
    }

    /// Flush any mmap'd changes to disk. A no-op for the heap variant,
    /// since heap writers are expected to write through the `File` handle
    /// directly.
    pub fn flush(&self) -> io::Result<()> {
        match self {
            MappedFile::Mmap(m) => m.flush(),
            MappedFile::Heap(_) => Ok(()),
        }
    }
}
