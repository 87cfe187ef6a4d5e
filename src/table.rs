//! Consecutive-byte access to table data.
//!
//! Rows and characters are 1-based, as table callers count them. A
//! transfer longer than a row simply continues into the following rows;
//! a write that runs past the last row grows the row count.

use crate::{
    bio::Bcache,
    disk::Disk,
    error::{Error, Result},
    file::{EofMode, FileId},
};

impl<D: Disk> Bcache<D> {
    /// Reads `dst.len()` bytes starting at character `firstchar` of row
    /// `firstrow`. Fails with `BadRowNum` when the range runs past the
    /// last row of the table.
    pub fn read_table_bytes(
        &mut self,
        f: FileId,
        firstrow: i64,
        firstchar: i64,
        dst: &mut [u8],
    ) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let (pos, endrow) = self.table_pos(f, firstrow, firstchar, dst.len())?;
        if endrow > self.state(f)?.hdu.numrows {
            return Err(Error::BadRowNum);
        }
        self.seek(f, pos, EofMode::Report)?;
        self.read_bytes(f, dst)
    }

    /// Writes `src` starting at character `firstchar` of row `firstrow`,
    /// growing `numrows` when the write ends past the current last row.
    pub fn write_table_bytes(
        &mut self,
        f: FileId,
        firstrow: i64,
        firstchar: i64,
        src: &[u8],
    ) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        let (pos, endrow) = self.table_pos(f, firstrow, firstchar, src.len())?;
        self.seek(f, pos, EofMode::Ignore)?;
        self.write_bytes(f, src)?;
        let st = self.state_mut(f)?;
        if endrow > st.hdu.numrows {
            st.hdu.numrows = endrow;
        }
        Ok(())
    }

    /// Validates the 1-based row/char pair and maps it to an absolute byte
    /// position; also returns the last row the transfer touches.
    fn table_pos(&self, f: FileId, firstrow: i64, firstchar: i64, n: usize) -> Result<(i64, u64)> {
        if firstrow < 1 {
            return Err(Error::BadRowNum);
        }
        if firstchar < 1 {
            return Err(Error::BadElemNum);
        }
        let hdu = &self.state(f)?.hdu;
        if hdu.rowlength == 0 {
            return Err(Error::BadRowNum);
        }
        let (firstrow, firstchar) = (firstrow as u64, firstchar as u64);
        let endrow = (firstchar + n as u64 - 2) / hdu.rowlength + firstrow;
        let pos = hdu.datastart + (firstrow - 1) * hdu.rowlength + firstchar - 1;
        Ok((pos as i64, endrow))
    }
}
