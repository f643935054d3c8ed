//! Backing-store abstraction.
//!
//! The facade and the transport codec both operate against "some byte
//! store that can be read, written, and seeked" — a file on disk in
//! production, a `Cursor<Vec<u8>>` in tests. `ReadWriteSeek` is the trait
//! bound both paths are generic over, mirroring the teacher's
//! `Cursor<Vec<u8>>`-backed in-memory parse buffer.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, Write};

pub trait ReadWriteSeek: Read + Write + Seek {}

impl<T: Read + Write + Seek> ReadWriteSeek for T {}

/// An in-memory backing store, used by unit tests that exercise the
/// header/part/meta/hash/merkle layers without touching a filesystem.
pub struct MemoryStore {
    inner: Cursor<Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore {
            inner: Cursor::new(Vec::new()),
        }
    }

    pub fn with_capacity(capacity: usize) -> MemoryStore {
        MemoryStore {
            inner: Cursor::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.inner.into_inner()
    }

    pub fn len(&self) -> u64 {
        self.inner.get_ref().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl Read for MemoryStore {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for MemoryStore {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for MemoryStore {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

/// Opens `path` for read+write, creating it if absent. Matches the
/// facade's file-backed mode.
pub fn open_file(path: &std::path::Path, create: bool) -> io::Result<File> {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    #[test]
    fn memory_store_round_trip() {
        let mut store = MemoryStore::new();
        store.write_all(b"hello world").unwrap();
        store.seek(SeekFrom::Start(0)).unwrap();

        let mut buf = [0u8; 5];
        store.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }
}
