//! The output image while it is being built.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::sparse::Sink;

/// A zero-filled image under a temporary name next to its final location.
///
/// Dropping the handle without [`ImageHandle::persist`] removes the file.
#[derive(Debug)]
pub struct ImageHandle {
    file: NamedTempFile,
    capacity: u64,
}

impl ImageHandle {
    /// Create a sparse, zero-filled file of `capacity` bytes inside `dir`.
    pub fn create(dir: &Path, capacity: u64) -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix(".pioneer-imager-")
            .suffix(".img.tmp")
            .tempfile_in(dir)
            .map_err(|e| Error::disk_write("image", format!("create in {}: {}", dir.display(), e)))?;
        file.as_file()
            .set_len(capacity)
            .map_err(|e| Error::disk_write("image", format!("resize to {} bytes: {}", capacity, e)))?;
        Ok(Self { file, capacity })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn file(&self) -> &File {
        self.file.as_file()
    }

    /// Writable view of `size` bytes at `start`, named `partition` in errors.
    pub fn region<'a>(&'a self, partition: &'a str, start: u64, size: u64) -> Region<'a> {
        Region {
            file: self.file(),
            partition,
            start,
            size,
        }
    }

    /// Read `len` bytes at `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file()
            .read_exact_at(&mut buf, offset)
            .map_err(|e| Error::disk_write("image", format!("read at {:#x}: {}", offset, e)))?;
        Ok(buf)
    }

    pub fn sync(&self) -> Result<()> {
        self.file()
            .sync_all()
            .map_err(|e| Error::disk_write("image", format!("sync: {}", e)))
    }

    /// Check the size, flush, and atomically rename to `dest`.
    pub fn persist(self, dest: &Path) -> Result<PathBuf> {
        let len = self
            .file()
            .metadata()
            .map_err(|e| Error::disk_write("image", e))?
            .len();
        if len != self.capacity {
            return Err(Error::disk_write(
                "image",
                format!("image is {} bytes, expected {}", len, self.capacity),
            ));
        }
        self.sync()?;
        self.file
            .persist(dest)
            .map_err(|e| Error::disk_write("image", format!("publish as {}: {}", dest.display(), e.error)))?;
        Ok(dest.to_path_buf())
    }
}

/// Bounds-checked window into the image.
#[derive(Debug, Clone, Copy)]
pub struct Region<'a> {
    file: &'a File,
    partition: &'a str,
    start: u64,
    size: u64,
}

impl Region<'_> {
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Sink for Region<'_> {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let fits = offset
            .checked_add(data.len() as u64)
            .is_some_and(|end| end <= self.size);
        if !fits {
            return Err(Error::disk_write(
                self.partition,
                format!(
                    "{} bytes at offset {:#x} overrun the {:#x} byte extent",
                    data.len(),
                    offset,
                    self.size
                ),
            ));
        }
        self.file
            .write_all_at(data, self.start + offset)
            .map_err(|e| Error::disk_write(self.partition, e))
    }

    /// The image is created zero-filled and extents never overlap.
    fn zeroed(&self) -> bool {
        true
    }
}
