//! Typed array transfers.
//!
//! Readers take an absolute byte position and the byte stride between
//! consecutive values; writers run at the current cursor, like the byte
//! engine they sit on. A stride equal to the element size is a contiguous
//! transfer; a contiguous get big enough for the direct path skips the
//! `seek` and temporarily overrides the cursor instead, so the pool never
//! sees the range at all. Strided transfers go through the group engine.
//!
//! Conversion between native and disk order happens in place in the
//! caller's buffer: a get returns native values, and a put leaves the
//! buffer in disk order afterwards.

use zerocopy::AsBytes;

use crate::{
    bio::Bcache,
    convert,
    disk::Disk,
    error::{Error, Result},
    file::{EofMode, FileId},
    param::DIRECT_CUTOFF,
};

impl<D: Disk> Bcache<D> {
    pub fn get_u8(&mut self, f: FileId, pos: i64, stride: usize, values: &mut [u8]) -> Result<()> {
        self.get_array(f, pos, stride, 1, values)
    }

    pub fn get_i16(
        &mut self,
        f: FileId,
        pos: i64,
        stride: usize,
        values: &mut [i16],
    ) -> Result<()> {
        self.get_array(f, pos, stride, 2, values.as_bytes_mut())?;
        convert::swap_i16(values);
        Ok(())
    }

    pub fn get_i32(
        &mut self,
        f: FileId,
        pos: i64,
        stride: usize,
        values: &mut [i32],
    ) -> Result<()> {
        self.get_array(f, pos, stride, 4, values.as_bytes_mut())?;
        convert::swap_i32(values);
        Ok(())
    }

    pub fn get_f32(
        &mut self,
        f: FileId,
        pos: i64,
        stride: usize,
        values: &mut [f32],
    ) -> Result<()> {
        self.get_array(f, pos, stride, 4, values.as_bytes_mut())?;
        convert::swap_f32(values);
        Ok(())
    }

    pub fn get_f64(
        &mut self,
        f: FileId,
        pos: i64,
        stride: usize,
        values: &mut [f64],
    ) -> Result<()> {
        self.get_array(f, pos, stride, 8, values.as_bytes_mut())?;
        convert::swap_f64(values);
        Ok(())
    }

    pub fn put_u8(&mut self, f: FileId, stride: usize, values: &[u8]) -> Result<()> {
        self.put_array(f, stride, 1, values)
    }

    pub fn put_i16(&mut self, f: FileId, stride: usize, values: &mut [i16]) -> Result<()> {
        convert::swap_i16(values);
        self.put_array(f, stride, 2, values.as_bytes())
    }

    pub fn put_i32(&mut self, f: FileId, stride: usize, values: &mut [i32]) -> Result<()> {
        convert::swap_i32(values);
        self.put_array(f, stride, 4, values.as_bytes())
    }

    pub fn put_f32(&mut self, f: FileId, stride: usize, values: &mut [f32]) -> Result<()> {
        convert::swap_f32(values);
        self.put_array(f, stride, 4, values.as_bytes())
    }

    pub fn put_f64(&mut self, f: FileId, stride: usize, values: &mut [f64]) -> Result<()> {
        convert::swap_f64(values);
        self.put_array(f, stride, 8, values.as_bytes())
    }

    fn get_array(
        &mut self,
        f: FileId,
        pos: i64,
        stride: usize,
        elsize: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        if stride < elsize {
            return Err(Error::BadDimen);
        }
        if stride == elsize {
            if buf.len() < DIRECT_CUTOFF {
                self.seek(f, pos, EofMode::Report)?;
                return self.read_bytes(f, buf);
            }
            // Direct read: override the cursor instead of seeking, so the
            // range's records are never pulled into the pool. The cursor
            // goes back where it was no matter how the read ends.
            if pos < 0 {
                return Err(Error::NegFilePos);
            }
            let saved = self.state(f)?.bytepos;
            self.state_mut(f)?.bytepos = pos as u64;
            let mut this = scopeguard::guard(self, |this| {
                if let Ok(st) = this.state_mut(f) {
                    st.bytepos = saved;
                }
            });
            return this.read_bytes(f, buf);
        }
        self.seek(f, pos, EofMode::Report)?;
        self.read_groups(f, elsize, buf.len() / elsize, stride - elsize, buf)
    }

    fn put_array(&mut self, f: FileId, stride: usize, elsize: usize, buf: &[u8]) -> Result<()> {
        if stride < elsize {
            return Err(Error::BadDimen);
        }
        if stride == elsize {
            return self.write_bytes(f, buf);
        }
        self.write_groups(f, elsize, buf.len() / elsize, stride - elsize, buf)
    }
}
