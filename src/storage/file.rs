use crate::storage::{AccessContext, FileStorage};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const DEFAULT_PAGE_SIZE: usize = 8192;

/// A [`FileStorage`] over a plain file. Pages are contiguous fixed-size
/// slices of the file; reads past the current end come back zeroed and
/// writes extend the file as needed, so the file grows lazily with the
/// highest page ever flushed.
pub struct PagedFile {
    file: Mutex<File>,
    page_size: usize,
    context: AccessContext,
}

impl PagedFile {
    pub fn create(path: &Path, page_size: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::from_file(file, page_size)
    }

    pub fn open(path: &Path, page_size: usize) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(file, page_size)
    }

    fn from_file(file: File, page_size: usize) -> io::Result<Self> {
        if page_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "page size must be non-zero",
            ));
        }
        Ok(Self {
            file: Mutex::new(file),
            page_size,
            context: AccessContext::new(),
        })
    }

    pub fn num_pages(&self) -> io::Result<u64> {
        let file = self.file.lock();
        let len = file.metadata()?.len();
        Ok(len.div_ceil(self.page_size as u64))
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.lock().sync_all()
    }

    fn check_buf(&self, buf_len: usize) -> io::Result<()> {
        if buf_len != self.page_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "buffer size must match page size ({}), got {}",
                    self.page_size, buf_len
                ),
            ));
        }
        Ok(())
    }
}

impl FileStorage for PagedFile {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn access_context(&self) -> &AccessContext {
        &self.context
    }

    fn read_page(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.check_buf(buf.len())?;

        let mut file = self.file.lock();
        let file_size = file.metadata()?.len();

        if offset >= file_size {
            buf.fill(0);
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        let available = ((file_size - offset) as usize).min(buf.len());
        file.read_exact(&mut buf[..available])?;
        buf[available..].fill(0);

        Ok(())
    }

    fn write_page(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.check_buf(buf.len())?;

        let mut file = self.file.lock();
        let file_size = file.metadata()?.len();

        let end = offset + buf.len() as u64;
        if end > file_size {
            file.set_len(end)?;
        }

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        file.sync_all()?;

        Ok(())
    }
}
