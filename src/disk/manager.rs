use crate::error::{BufferError, BufferResult};
use crate::page::PageId;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const PAGE_SIZE: usize = 4096;

/// Block I/O over a single database file. Pages live at fixed offsets
/// `page_id * PAGE_SIZE`; page ids are minted by the buffer pool, not here.
///
/// The file only ever grows in whole pages, so its length divided by
/// `PAGE_SIZE` is the number of addressable blocks.
pub struct DiskManager {
    file: File,
}

impl DiskManager {
    pub fn create(path: &Path) -> BufferResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self { file })
    }

    pub fn open(path: &Path) -> BufferResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self { file })
    }

    /// Fills `buf` with the page's current on-disk content. Reading a page
    /// the file does not reach yet is an error, not a zero fill.
    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> BufferResult<()> {
        check_page_len(buf.len())?;
        if page_id.0 >= self.num_pages()? {
            return Err(BufferError::PageNotFound(page_id));
        }

        self.seek_to(page_id)?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Durably stores `data` as the page's content, growing the file when
    /// the page lies past its current end.
    pub fn write_page(&mut self, page_id: PageId, data: &[u8]) -> BufferResult<()> {
        check_page_len(data.len())?;
        self.grow_to_hold(page_id)?;

        self.seek_to(page_id)?;
        self.file.write_all(data)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Number of pages the file currently holds.
    pub fn num_pages(&self) -> BufferResult<u32> {
        Ok((self.file.metadata()?.len() / PAGE_SIZE as u64) as u32)
    }

    fn grow_to_hold(&mut self, page_id: PageId) -> BufferResult<()> {
        let required = (page_id.0 as u64 + 1) * PAGE_SIZE as u64;
        if self.file.metadata()?.len() < required {
            self.file.set_len(required)?;
        }
        Ok(())
    }

    fn seek_to(&mut self, page_id: PageId) -> BufferResult<()> {
        self.file
            .seek(SeekFrom::Start(page_id.0 as u64 * PAGE_SIZE as u64))?;
        Ok(())
    }
}

fn check_page_len(len: usize) -> BufferResult<()> {
    if len != PAGE_SIZE {
        return Err(BufferError::InvalidPageSize {
            expected: PAGE_SIZE,
            actual: len,
        });
    }
    Ok(())
}
