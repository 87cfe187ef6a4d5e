//! Byte and strided transfer engines.
//!
//! `read_bytes` and `write_bytes` move arbitrary byte ranges at the file's
//! cursor. Small transfers go record by record through the pool; transfers
//! of `DIRECT_CUTOFF` bytes or more hand the interior of the range to the
//! driver in one call and only route the partial records at either end
//! through the pool.
//!
//! `read_groups` and `write_groups` move `ngroups` equal-sized runs of
//! bytes separated by a constant gap, the access pattern of pixel subsets
//! and table columns. They keep a live record cursor across the whole
//! operation instead of re-deriving it from the file position per group.

use core::cmp;

use log::trace;

use crate::{
    bio::Bcache,
    disk::Disk,
    error::{Error, Result},
    file::{EofMode, FileId},
    param::{BSIZE, DIRECT_CUTOFF, NBUF},
};

impl<D: Disk> Bcache<D> {
    /// Moves the byte cursor to `pos`, making the record containing it
    /// current. Moving past the logical end of file is an error under
    /// `EofMode::Report` and materializes the record under
    /// `EofMode::Ignore` (the usual choice before a write).
    pub fn seek(&mut self, f: FileId, pos: i64, mode: EofMode) -> Result<()> {
        if pos < 0 {
            return Err(Error::NegFilePos);
        }
        let pos = pos as u64;
        let rec = pos / BSIZE as u64;
        match self.cur_slot(f)? {
            Some(n) if self.slots[n].recno == rec => {}
            _ => {
                let _ = self.load(f, rec, mode)?;
            }
        }
        self.state_mut(f)?.bytepos = pos;
        Ok(())
    }

    /// The slot holding `f`'s current record, if it still does.
    fn cur_slot(&self, f: FileId) -> Result<Option<usize>> {
        let st = self.state(f)?;
        Ok(st.curslot.filter(|&n| self.slots[n].owner == Some(f)))
    }

    /// Makes the record containing the cursor current and returns its slot.
    fn resolve(&mut self, f: FileId, mode: EofMode) -> Result<usize> {
        let st = self.state(f)?;
        let rec = st.bytepos / BSIZE as u64;
        if let Some(n) = st.curslot {
            if self.slots[n].owner == Some(f) && self.slots[n].recno == rec {
                return Ok(n);
            }
        }
        self.load(f, rec, mode)
    }

    /// Writes `src` at the cursor and advances it past the written range.
    /// Writing past the end of file extends the file; the extension
    /// becomes physical at writeback time.
    pub fn write_bytes(&mut self, f: FileId, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        if src.len() >= DIRECT_CUTOFF {
            return self.write_direct(f, src);
        }
        let mut n = self.resolve(f, EofMode::Ignore)?;
        let mut done = 0;
        loop {
            let copied = {
                let Self { slots, files, .. } = self;
                let slot = &mut slots[n];
                let st = files
                    .get_mut(f.0)
                    .and_then(|e| e.as_mut())
                    .ok_or(Error::BadHandle)?;
                let off = (st.bytepos - slot.recno * BSIZE as u64) as usize;
                let m = cmp::min(src.len() - done, BSIZE - off);
                slot.data[off..off + m].copy_from_slice(&src[done..done + m]);
                slot.dirty = true;
                st.bytepos += m as u64;
                m
            };
            done += copied;
            if done == src.len() {
                return Ok(());
            }
            let next = self.state(f)?.bytepos / BSIZE as u64;
            n = self.load(f, next, EofMode::Ignore)?;
        }
    }

    /// The direct write path: fill out the current record in the pool,
    /// push the interior of the range to the driver in one transfer, and
    /// route the final partial record back through the pool.
    fn write_direct(&mut self, f: FileId, src: &[u8]) -> Result<()> {
        let bs = BSIZE as u64;
        let nbuff = self.resolve(f, EofMode::Ignore)?;
        let recstart = self.slots[nbuff].recno;
        let mut filepos = self.state(f)?.bytepos;
        let recend = (filepos + src.len() as u64 - 1) / bs;

        // Fill out the current record.
        let headlen = {
            let Self { slots, files, .. } = self;
            let slot = &mut slots[nbuff];
            let st = files
                .get_mut(f.0)
                .and_then(|e| e.as_mut())
                .ok_or(Error::BadHandle)?;
            let off = (st.bytepos - recstart * bs) as usize;
            let space = BSIZE - off;
            slot.data[off..].copy_from_slice(&src[..space]);
            slot.dirty = true;
            space
        };
        filepos += headlen as u64;
        let mut todo = &src[headlen..];
        self.state_mut(f)?.curslot = None;

        // No resident record of this file may contradict the direct
        // write: push out whatever is dirty in the affected range, then
        // release every affected record.
        for i in 0..NBUF {
            let affected = {
                let s = &self.slots[i];
                s.owner == Some(f) && s.recno >= recstart && s.recno <= recend
            };
            if affected {
                if self.slots[i].dirty {
                    self.writeback(i)?;
                }
                self.slots[i].owner = None;
                self.slots[i].dirty = false;
            }
        }

        // Every complete record except the last goes out in one transfer.
        let nwrite = (todo.len() - 1) / BSIZE * BSIZE;
        {
            let st = self.state_mut(f)?;
            if st.io_pos != filepos {
                st.disk.seek(filepos)?;
            }
            st.disk.write(&todo[..nwrite])?;
            st.io_pos = filepos + nwrite as u64;
        }
        todo = &todo[nwrite..];
        trace!(
            "bcache: file {} direct write, recs {}..={}",
            f.0,
            recstart,
            recend
        );

        // The tail partial record lives in the pool again: on top of
        // fresh fill when the file just grew to meet it, on top of the
        // existing record otherwise.
        let Self { slots, files, .. } = self;
        let slot = &mut slots[nbuff];
        let st = files
            .get_mut(f.0)
            .and_then(|e| e.as_mut())
            .ok_or(Error::BadHandle)?;
        if st.io_pos >= st.filesize {
            st.filesize = st.io_pos;
            slot.data.fill(st.hdu.fill());
        } else {
            st.disk.read(&mut slot.data[..])?;
            st.io_pos += bs;
        }
        slot.data[..todo.len()].copy_from_slice(todo);
        slot.dirty = true;
        slot.recno = recend;
        slot.owner = Some(f);
        st.curslot = Some(nbuff);
        st.logfilesize = st.logfilesize.max((recend + 1) * bs);
        st.bytepos = filepos + nwrite as u64 + todo.len() as u64;
        Ok(())
    }

    /// Reads `dst.len()` bytes at the cursor. A buffered read advances the
    /// cursor; a direct read (at or above `DIRECT_CUTOFF`) leaves it at
    /// the start of the range, so callers position with `seek` first.
    pub fn read_bytes(&mut self, f: FileId, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        if dst.len() >= DIRECT_CUTOFF {
            return self.read_direct(f, dst);
        }
        let mut n = self.resolve(f, EofMode::Report)?;
        let mut done = 0;
        loop {
            let copied = {
                let Self { slots, files, .. } = self;
                let slot = &slots[n];
                let st = files
                    .get_mut(f.0)
                    .and_then(|e| e.as_mut())
                    .ok_or(Error::BadHandle)?;
                let off = (st.bytepos - slot.recno * BSIZE as u64) as usize;
                let m = cmp::min(dst.len() - done, BSIZE - off);
                dst[done..done + m].copy_from_slice(&slot.data[off..off + m]);
                st.bytepos += m as u64;
                m
            };
            done += copied;
            if done == dst.len() {
                return Ok(());
            }
            let next = self.state(f)?.bytepos / BSIZE as u64;
            n = self.load(f, next, EofMode::Report)?;
        }
    }

    /// The direct read path: flush (but keep) any dirty resident record
    /// overlapping the range, then read it from the driver in one call.
    fn read_direct(&mut self, f: FileId, dst: &mut [u8]) -> Result<()> {
        let bs = BSIZE as u64;
        let filepos = self.state(f)?.bytepos;
        let recstart = filepos / bs;
        let recend = (filepos + dst.len() as u64 - 1) / bs;
        for i in 0..NBUF {
            let pending = {
                let s = &self.slots[i];
                s.dirty && s.owner == Some(f) && s.recno >= recstart && s.recno <= recend
            };
            if pending {
                self.writeback(i)?;
            }
        }
        trace!(
            "bcache: file {} direct read, recs {}..={}",
            f.0,
            recstart,
            recend
        );
        let st = self.state_mut(f)?;
        if st.io_pos != filepos {
            st.disk.seek(filepos)?;
        }
        st.disk.read(dst)?;
        st.io_pos = filepos + dst.len() as u64;
        Ok(())
    }

    /// Writes `ngroups` runs of `gsize` bytes from `src`, each separated
    /// by `gap` bytes that are left untouched. The cursor must already sit
    /// at the first group; afterwards it sits just past the last one.
    pub fn write_groups(
        &mut self,
        f: FileId,
        gsize: usize,
        ngroups: usize,
        gap: usize,
        src: &[u8],
    ) -> Result<()> {
        if gsize == 0 || gsize.checked_mul(ngroups) != Some(src.len()) {
            return Err(Error::BadDimen);
        }
        if ngroups == 0 {
            return Ok(());
        }
        let bs = BSIZE as u64;
        let start = self.state(f)?.bytepos;
        let mut n = self.resolve(f, EofMode::Ignore)?;
        let mut recno = self.slots[n].recno;
        let mut off = (start - recno * bs) as usize;

        for g in 0..ngroups {
            if g > 0 && gap > 0 {
                // Advance the cursor over the gap without touching the
                // records it covers; only the record the next group
                // starts in gets loaded.
                let abs = recno * bs + off as u64 + gap as u64;
                recno = abs / bs;
                off = (abs % bs) as usize;
            }
            let base = g * gsize;
            let mut copied = 0;
            while copied < gsize {
                if off == BSIZE {
                    recno += 1;
                    off = 0;
                }
                if self.slots[n].owner != Some(f) || self.slots[n].recno != recno {
                    n = self.load(f, recno, EofMode::Ignore)?;
                }
                let m = cmp::min(gsize - copied, BSIZE - off);
                let slot = &mut self.slots[n];
                slot.data[off..off + m].copy_from_slice(&src[base + copied..base + copied + m]);
                slot.dirty = true;
                off += m;
                copied += m;
            }
        }

        let st = self.state_mut(f)?;
        st.bytepos = start
            + ngroups as u64 * gsize as u64
            + (ngroups as u64 - 1) * gap as u64;
        Ok(())
    }

    /// Reads `ngroups` runs of `gsize` bytes into `dst`, each separated by
    /// `gap` bytes that are skipped. Mirror of `write_groups`.
    pub fn read_groups(
        &mut self,
        f: FileId,
        gsize: usize,
        ngroups: usize,
        gap: usize,
        dst: &mut [u8],
    ) -> Result<()> {
        if gsize == 0 || gsize.checked_mul(ngroups) != Some(dst.len()) {
            return Err(Error::BadDimen);
        }
        if ngroups == 0 {
            return Ok(());
        }
        let bs = BSIZE as u64;
        let start = self.state(f)?.bytepos;
        let mut n = self.resolve(f, EofMode::Report)?;
        let mut recno = self.slots[n].recno;
        let mut off = (start - recno * bs) as usize;

        for g in 0..ngroups {
            if g > 0 && gap > 0 {
                let abs = recno * bs + off as u64 + gap as u64;
                recno = abs / bs;
                off = (abs % bs) as usize;
            }
            let base = g * gsize;
            let mut copied = 0;
            while copied < gsize {
                if off == BSIZE {
                    recno += 1;
                    off = 0;
                }
                if self.slots[n].owner != Some(f) || self.slots[n].recno != recno {
                    n = self.load(f, recno, EofMode::Report)?;
                }
                let m = cmp::min(gsize - copied, BSIZE - off);
                let slot = &self.slots[n];
                dst[base + copied..base + copied + m]
                    .copy_from_slice(&slot.data[off..off + m]);
                off += m;
                copied += m;
            }
        }

        let st = self.state_mut(f)?;
        st.bytepos = start
            + ngroups as u64 * gsize as u64
            + (ngroups as u64 - 1) * gap as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemFile;
    use crate::file::Hdu;
    use std::vec::Vec;

    fn setup() -> (Bcache<MemFile>, FileId) {
        env_logger::try_init().ok();
        let mut c = Bcache::new();
        let f = c.open(MemFile::new(), Hdu::image(8, 0)).unwrap();
        (c, f)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn small_write_lands_in_the_first_record() {
        let (mut c, f) = setup();
        c.seek(f, 0, EofMode::Ignore).unwrap();
        c.write_bytes(f, b"ABC").unwrap();
        c.flush(f, true).unwrap();
        let disk = c.close(f).unwrap();
        assert_eq!(disk.len(), BSIZE);
        assert_eq!(&disk.as_slice()[..3], b"ABC");
        assert!(disk.as_slice()[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn sparse_write_fills_the_leading_records() {
        let (mut c, f) = setup();
        c.seek(f, 5000, EofMode::Ignore).unwrap();
        c.write_bytes(f, b"WXYZ").unwrap();
        c.flush(f, true).unwrap();
        let disk = c.close(f).unwrap();
        assert_eq!(disk.len(), 2 * BSIZE);
        assert!(disk.as_slice()[..5000].iter().all(|&b| b == 0));
        assert_eq!(&disk.as_slice()[5000..5004], b"WXYZ");
        assert!(disk.as_slice()[5004..].iter().all(|&b| b == 0));
    }

    #[test]
    fn direct_write_from_a_standing_start() {
        let (mut c, f) = setup();
        let data = vec![0xAA; 6000];
        c.write_bytes(f, &data).unwrap();
        assert_eq!(c.position(f).unwrap(), 6000);
        c.flush(f, true).unwrap();
        let disk = c.close(f).unwrap();
        assert_eq!(disk.len(), 3 * BSIZE);
        assert!(disk.as_slice()[..6000].iter().all(|&b| b == 0xAA));
        assert!(disk.as_slice()[6000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn out_of_order_sparse_writes_extend_monotonically() {
        let (mut c, f) = setup();
        c.seek(f, 10000, EofMode::Ignore).unwrap();
        c.write_bytes(f, b"x").unwrap();
        c.seek(f, 6000, EofMode::Ignore).unwrap();
        c.write_bytes(f, b"y").unwrap();
        c.flush(f, true).unwrap();
        let disk = c.close(f).unwrap();
        assert_eq!(disk.len(), 4 * BSIZE);
        assert_eq!(disk.as_slice()[6000], b'y');
        assert_eq!(disk.as_slice()[10000], b'x');
        assert_eq!(disk.as_slice()[5999], 0);
        assert_eq!(disk.as_slice()[6001], 0);
    }

    #[test]
    fn write_read_round_trip_across_sizes_and_offsets() {
        // Small, record-straddling, exactly-at-cutoff and beyond-cutoff
        // transfers at aligned and unaligned positions.
        let cases: &[(i64, usize)] = &[
            (0, 1),
            (0, BSIZE),
            (1000, 100),
            (2879, 2),
            (2880, 2880),
            (100, DIRECT_CUTOFF),
            (0, DIRECT_CUTOFF + 1),
            (4321, 3 * BSIZE + 17),
            (10 * BSIZE as i64, 123),
        ];
        for &(pos, len) in cases {
            let (mut c, f) = setup();
            let data = pattern(len);
            c.seek(f, pos, EofMode::Ignore).unwrap();
            c.write_bytes(f, &data).unwrap();
            c.flush(f, true).unwrap();
            c.check_invariants();

            let mut back = vec![0; len];
            c.seek(f, pos, EofMode::Report).unwrap();
            c.read_bytes(f, &mut back).unwrap();
            assert_eq!(back, data, "pos {} len {}", pos, len);
            c.check_invariants();
        }
    }

    #[test]
    fn read_observes_unflushed_writes() {
        let (mut c, f) = setup();
        c.seek(f, 4000, EofMode::Ignore).unwrap();
        c.write_bytes(f, b"pending").unwrap();
        let mut back = [0; 7];
        c.seek(f, 4000, EofMode::Report).unwrap();
        c.read_bytes(f, &mut back).unwrap();
        assert_eq!(&back, b"pending");
        assert_eq!(c.filesize(f).unwrap(), 0);
    }

    #[test]
    fn direct_read_sees_dirty_overlapping_records() {
        let (mut c, f) = setup();
        let data = pattern(4 * BSIZE);
        c.write_bytes(f, &data).unwrap();
        c.flush(f, false).unwrap();
        // Dirty one record in the middle of the range, then read the
        // whole range directly.
        c.seek(f, 3000, EofMode::Ignore).unwrap();
        c.write_bytes(f, b"DIRTY").unwrap();
        let mut back = vec![0; 4 * BSIZE];
        c.seek(f, 0, EofMode::Report).unwrap();
        c.read_bytes(f, &mut back).unwrap();
        assert_eq!(&back[3000..3005], b"DIRTY");
        assert_eq!(&back[..3000], &data[..3000]);
        // A direct read leaves the cursor at the start of the range.
        assert_eq!(c.position(f).unwrap(), 0);
    }

    #[test]
    fn negative_seek_is_rejected() {
        let (mut c, f) = setup();
        assert_eq!(c.seek(f, -1, EofMode::Ignore), Err(Error::NegFilePos));
    }

    #[test]
    fn reading_past_logical_end_reports_eof() {
        let (mut c, f) = setup();
        assert_eq!(c.seek(f, 0, EofMode::Report), Err(Error::EndOfFile));
        c.write_bytes(f, b"abc").unwrap();
        // The record exists now; reading within it works, crossing into
        // the next one fails.
        c.seek(f, 2000, EofMode::Report).unwrap();
        let mut buf = [0; 2000];
        assert_eq!(c.read_bytes(f, &mut buf), Err(Error::EndOfFile));
        // The first chunk was still delivered and the cursor advanced
        // over it.
        assert_eq!(c.position(f).unwrap(), BSIZE as u64);
    }

    #[test]
    fn groups_round_trip_over_geometries() {
        let geometries: &[(usize, usize, usize)] = &[
            (3, 10, 5),
            (80, 36, 0),
            (100, 7, BSIZE),
            (1, 100, 287),
            (BSIZE, 2, 8),
            (4000, 3, 100),
        ];
        for &(gsize, ngroups, gap) in geometries {
            let (mut c, f) = setup();
            let data = pattern(gsize * ngroups);
            c.seek(f, 123, EofMode::Ignore).unwrap();
            c.write_groups(f, gsize, ngroups, gap, &data).unwrap();
            assert_eq!(
                c.position(f).unwrap(),
                123 + (gsize * ngroups + (ngroups - 1) * gap) as u64
            );
            c.flush(f, true).unwrap();
            c.check_invariants();

            let mut back = vec![0; gsize * ngroups];
            c.seek(f, 123, EofMode::Report).unwrap();
            c.read_groups(f, gsize, ngroups, gap, &mut back).unwrap();
            assert_eq!(back, data, "gsize {} ngroups {} gap {}", gsize, ngroups, gap);
        }
    }

    #[test]
    fn group_gaps_leave_existing_bytes_alone() {
        let (mut c, f) = setup();
        let base = vec![0x55; 4 * BSIZE];
        c.write_bytes(f, &base).unwrap();
        c.flush(f, false).unwrap();

        let gsize = 10;
        let ngroups = 20;
        let gap = 500;
        let data = pattern(gsize * ngroups);
        c.seek(f, 100, EofMode::Ignore).unwrap();
        c.write_groups(f, gsize, ngroups, gap, &data).unwrap();
        c.flush(f, true).unwrap();
        let disk = c.close(f).unwrap();

        let mut expect = base;
        let mut pos = 100;
        for g in 0..ngroups {
            expect[pos..pos + gsize].copy_from_slice(&data[g * gsize..(g + 1) * gsize]);
            pos += gsize + gap;
        }
        assert_eq!(disk.as_slice(), &expect[..]);
    }

    #[test]
    fn group_geometry_must_match_the_buffer() {
        let (mut c, f) = setup();
        c.seek(f, 0, EofMode::Ignore).unwrap();
        assert_eq!(
            c.write_groups(f, 3, 3, 0, &[0; 8]),
            Err(Error::BadDimen)
        );
        assert_eq!(
            c.read_groups(f, 0, 1, 0, &mut []),
            Err(Error::BadDimen)
        );
    }

    #[test]
    fn logical_size_tracks_the_furthest_record() {
        let (mut c, f) = setup();
        c.seek(f, 7 * BSIZE as i64, EofMode::Ignore).unwrap();
        c.write_bytes(f, b"tail").unwrap();
        assert_eq!(c.logical_size(f).unwrap(), 8 * BSIZE as u64);
        assert_eq!(c.filesize(f).unwrap(), 0);
        c.flush(f, false).unwrap();
        assert_eq!(c.filesize(f).unwrap(), 8 * BSIZE as u64);
        c.check_invariants();
    }
}
