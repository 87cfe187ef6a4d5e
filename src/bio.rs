//! Record cache.
//!
//! The record cache is a fixed pool of slots holding in-memory copies of
//! 2880-byte file records, shared by every open file. Caching records in
//! memory turns scattered small transfers into whole-record transfers and
//! lets sparse writes accumulate before touching the disk.
//!
//! Interface:
//! * To bring a record into the pool and make it a file's current record,
//!   call `load_record`.
//! * To move the byte cursor and transfer bytes, use the engine in `rw.rs`.
//! * To push every modified record of a file to the driver, call `flush`.
//! * A file's current record is pinned: the selector never evicts it to
//!   serve a different file. Each file pins at most one record, so up to
//!   `NBUF` files can be active at once.
//!
//! Slots are never deallocated; the selector reassigns them, oldest first.
//! A slot whose record lies past the physical end of file may be dirty
//! without any on-disk backing; the writeback protocol then extends the
//! file in ascending record order with deterministic fill so that no
//! record is ever written before one of lower index.

use core::ops::{Deref, DerefMut};

use alloc::boxed::Box;
use array_macro::array;
use arrayvec::ArrayVec;
use log::{debug, trace};

use crate::{
    disk::Disk,
    error::{Error, Result},
    file::{EofMode, FileId, FileState, Hdu, HduKind},
    param::{BSIZE, NBUF, NFILE},
};

/// Written out when the extension loop has to fill a gap between the
/// physical end of file and a record going out past it.
static ZERO_REC: [u8; BSIZE] = [0; BSIZE];

/// One record's payload.
pub(crate) struct RecData {
    bytes: [u8; BSIZE],
}

impl RecData {
    const fn new() -> Self {
        Self { bytes: [0; BSIZE] }
    }
}

impl Deref for RecData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl DerefMut for RecData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes
    }
}

/// One pool slot: a record's bytes plus the identity of the record.
pub(crate) struct Slot {
    /// File this record belongs to, or `None` when the slot is free.
    pub(crate) owner: Option<FileId>,

    /// Zero-based record number within the owning file.
    pub(crate) recno: u64,

    /// The in-memory copy has been modified and not yet written back.
    pub(crate) dirty: bool,

    pub(crate) data: RecData,
}

impl Slot {
    const fn new() -> Self {
        Self {
            owner: None,
            recno: 0,
            dirty: false,
            data: RecData::new(),
        }
    }
}

/// The record cache: the slot pool, the eviction order, and the table of
/// open files, all owned by one object. Slots name their file by id only,
/// so the pool never aliases the file states.
pub struct Bcache<D> {
    pub(crate) slots: Box<[Slot; NBUF]>,

    /// Eviction order, oldest first. Always a permutation of `0..NBUF`;
    /// touching a slot moves it to the youngest end.
    pub(crate) age: ArrayVec<usize, NBUF>,

    pub(crate) files: Box<[Option<FileState<D>>; NFILE]>,
}

impl<D: Disk> Default for Bcache<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Disk> Bcache<D> {
    pub fn new() -> Self {
        let mut age = ArrayVec::new();
        for i in 0..NBUF {
            age.push(i);
        }
        Self {
            slots: Box::new(array![_ => Slot::new(); NBUF]),
            age,
            files: Box::new(array![_ => None; NFILE]),
        }
    }

    /// Registers an open file with the cache and returns its handle. The
    /// physical size comes from the driver; the logical size starts at the
    /// next record boundary at or above it.
    pub fn open(&mut self, mut disk: D, hdu: Hdu) -> Result<FileId> {
        let size = disk.size()?;
        let idx = self
            .files
            .iter()
            .position(|e| e.is_none())
            .ok_or(Error::TooManyFiles)?;
        let bs = BSIZE as u64;
        self.files[idx] = Some(FileState {
            disk,
            bytepos: 0,
            io_pos: 0,
            filesize: size,
            logfilesize: (size + bs - 1) / bs * bs,
            curslot: None,
            hdu,
        });
        trace!("bcache: open file {} (size {})", idx, size);
        Ok(FileId(idx))
    }

    /// Flushes everything the file still has in the pool, releases its
    /// slots and its table entry, and hands the driver back. On error the
    /// file stays open so the close can be retried.
    pub fn close(&mut self, f: FileId) -> Result<D> {
        self.flush(f, true)?;
        let st = self
            .files
            .get_mut(f.0)
            .and_then(|e| e.take())
            .ok_or(Error::BadHandle)?;
        trace!("bcache: close file {}", f.0);
        Ok(st.disk)
    }

    /// Installs the navigator's view of the file's current HDU.
    pub fn set_hdu(&mut self, f: FileId, hdu: Hdu) -> Result<()> {
        self.state_mut(f)?.hdu = hdu;
        Ok(())
    }

    pub fn hdu(&self, f: FileId) -> Result<Hdu> {
        Ok(self.state(f)?.hdu)
    }

    /// Physical on-disk size, in bytes.
    pub fn filesize(&self, f: FileId) -> Result<u64> {
        Ok(self.state(f)?.filesize)
    }

    /// Logical size: the extent covered by cached records, possibly past
    /// the physical end of file. A record multiple.
    pub fn logical_size(&self, f: FileId) -> Result<u64> {
        Ok(self.state(f)?.logfilesize)
    }

    /// The byte cursor the next buffered transfer starts at.
    pub fn position(&self, f: FileId) -> Result<u64> {
        Ok(self.state(f)?.bytepos)
    }

    pub fn disk(&self, f: FileId) -> Result<&D> {
        Ok(&self.state(f)?.disk)
    }

    pub(crate) fn state(&self, f: FileId) -> Result<&FileState<D>> {
        self.files
            .get(f.0)
            .and_then(|e| e.as_ref())
            .ok_or(Error::BadHandle)
    }

    pub(crate) fn state_mut(&mut self, f: FileId) -> Result<&mut FileState<D>> {
        self.files
            .get_mut(f.0)
            .and_then(|e| e.as_mut())
            .ok_or(Error::BadHandle)
    }

    /// Ensures record `recno` of file `f` is resident and current.
    ///
    /// With `EofMode::Report`, a record at or beyond the logical end of
    /// file fails with `EndOfFile`. With `EofMode::Ignore`, such a record
    /// is materialized in memory, initialized to the HDU fill byte, marked
    /// dirty, and the logical size grows to cover it; the physical file is
    /// not touched until writeback.
    pub fn load_record(&mut self, f: FileId, recno: u64, mode: EofMode) -> Result<()> {
        let _ = self.load(f, recno, mode)?;
        Ok(())
    }

    /// `load_record`, returning the slot that became current.
    pub(crate) fn load(&mut self, f: FileId, recno: u64, mode: EofMode) -> Result<usize> {
        // Resolve: a hit, or a victim to fill. Scanning for the hit runs
        // youngest to oldest since hot records sit at the young end.
        let mut hit = None;
        for &i in self.age.iter().rev() {
            let s = &self.slots[i];
            if s.owner == Some(f) && s.recno == recno {
                hit = Some(i);
                break;
            }
        }
        let n = match hit {
            Some(n) => n,
            None => self.load_miss(f, recno, mode)?,
        };
        // Adopt: runs on both paths.
        self.state_mut(f)?.curslot = Some(n);
        self.touch(n);
        Ok(n)
    }

    fn load_miss(&mut self, f: FileId, recno: u64, mode: EofMode) -> Result<usize> {
        let bs = BSIZE as u64;
        let rstart = recno * bs;
        let st = self.state(f)?;
        if mode == EofMode::Report && rstart >= st.logfilesize {
            return Err(Error::EndOfFile);
        }

        let n = self.victim(f).ok_or(Error::TooManyFiles)?;
        if self.slots[n].dirty {
            self.writeback(n)?;
        }
        // The displaced file must not keep a current-record pointer to a
        // slot it no longer owns.
        if let Some(prev) = self.slots[n].owner {
            if let Some(pst) = self.files.get_mut(prev.0).and_then(|e| e.as_mut()) {
                if pst.curslot == Some(n) {
                    pst.curslot = None;
                }
            }
        }

        let Self { slots, files, .. } = self;
        let slot = &mut slots[n];
        let st = files
            .get_mut(f.0)
            .and_then(|e| e.as_mut())
            .ok_or(Error::BadHandle)?;
        if rstart >= st.filesize {
            slot.data.fill(st.hdu.fill());
            st.logfilesize = st.logfilesize.max(rstart + bs);
            slot.dirty = true;
            trace!("bcache: file {} rec {} materialized past eof", f.0, recno);
        } else {
            if st.io_pos != rstart {
                st.disk.seek(rstart)?;
            }
            st.disk.read(&mut slot.data[..])?;
            st.io_pos = rstart + bs;
            trace!("bcache: file {} rec {} read into slot {}", f.0, recno, n);
        }
        slot.owner = Some(f);
        slot.recno = recno;
        Ok(n)
    }

    /// Decides which slot to (re)use for a new record of file `f`: the
    /// oldest slot that is free or unpinned; failing that, the file's own
    /// current record; failing that, the coldest pin in the pool.
    fn victim(&self, f: FileId) -> Option<usize> {
        for &i in self.age.iter() {
            match self.slots[i].owner {
                None => return Some(i),
                Some(g) => {
                    let pinned = self
                        .files
                        .get(g.0)
                        .and_then(|e| e.as_ref())
                        .map_or(false, |st| st.curslot == Some(i));
                    if !pinned {
                        return Some(i);
                    }
                }
            }
        }
        if let Some(n) = self.state(f).ok().and_then(|st| st.curslot) {
            return Some(n);
        }
        self.age.first().copied()
    }

    /// Moves slot `n` to the youngest end of the eviction order.
    fn touch(&mut self, n: usize) {
        if let Some(pos) = self.age.iter().position(|&i| i == n) {
            let _ = self.age.remove(pos);
            self.age.push(n);
        }
    }

    /// Writes slot `n` out to its file.
    ///
    /// A record at or before the physical end of file is written in place
    /// (growing the file by one record when appending). A record strictly
    /// past it triggers the extension protocol: every resident record of
    /// the file between the current end and this one goes out first, in
    /// ascending record order, with zero records filling any remaining
    /// gap, so the on-disk extension is monotone.
    pub(crate) fn writeback(&mut self, n: usize) -> Result<()> {
        let Self { slots, files, .. } = self;
        let fid = match slots[n].owner {
            Some(fid) => fid,
            None => return Ok(()),
        };
        let st = files
            .get_mut(fid.0)
            .and_then(|e| e.as_mut())
            .ok_or(Error::BadHandle)?;
        let bs = BSIZE as u64;
        let filepos = slots[n].recno * bs;

        if filepos <= st.filesize {
            if st.io_pos != filepos {
                st.disk.seek(filepos)?;
            }
            st.disk.write(&slots[n].data[..])?;
            st.io_pos = filepos + bs;
            if filepos == st.filesize {
                st.filesize += bs;
            }
            slots[n].dirty = false;
            return Ok(());
        }

        debug!(
            "bcache: file {} extending from {} for rec {}",
            fid.0, st.filesize, slots[n].recno
        );
        if st.io_pos != st.filesize {
            st.disk.seek(st.filesize)?;
        }
        loop {
            let minrec = st.filesize / bs;
            // Lowest resident record between the end of file and the one
            // being written; unique by the pool's uniqueness invariant.
            let mut pick = n;
            let mut prec = slots[n].recno;
            for (i, s) in slots.iter().enumerate() {
                if s.owner == Some(fid) && s.recno >= minrec && s.recno < prec {
                    pick = i;
                    prec = s.recno;
                }
            }
            let target = prec * bs;
            if target > st.filesize {
                for _ in 0..(target - st.filesize) / bs {
                    st.disk.write(&ZERO_REC)?;
                }
                st.filesize = target;
            }
            st.disk.write(&slots[pick].data[..])?;
            slots[pick].dirty = false;
            st.filesize += bs;
            if pick == n {
                break;
            }
        }
        st.io_pos = st.filesize;
        Ok(())
    }

    /// Writes back every dirty record of file `f` and syncs the driver.
    /// With `clear`, also disassociates the file's slots, leaving nothing
    /// of it in the pool.
    pub fn flush(&mut self, f: FileId, clear: bool) -> Result<()> {
        let _ = self.state(f)?;
        for n in 0..NBUF {
            if self.slots[n].owner == Some(f) {
                if self.slots[n].dirty {
                    self.writeback(n)?;
                }
                if clear {
                    self.slots[n].owner = None;
                    self.slots[n].dirty = false;
                }
            }
        }
        let st = self.state_mut(f)?;
        if clear {
            st.curslot = None;
        }
        debug!("bcache: flush file {} (clear: {})", f.0, clear);
        st.disk.sync()
    }

    /// The buffer half of an HDU boundary flush. The navigator closes out
    /// the current HDU before this call and reopens it afterwards; this
    /// call guarantees that everything the closed-out HDU put in the pool
    /// is durable.
    pub fn flush_hdu(&mut self, f: FileId) -> Result<()> {
        self.flush(f, false)
    }

    /// Disassociates every record of `f` lying at or past the physical end
    /// of file. Used after an operation that logically shrinks the file;
    /// whatever those records held is discarded.
    pub fn drop_past_eof(&mut self, f: FileId) -> Result<()> {
        let filesize = self.state(f)?.filesize;
        for n in 0..NBUF {
            let s = &mut self.slots[n];
            if s.owner == Some(f) && s.recno * BSIZE as u64 >= filesize {
                s.owner = None;
                s.dirty = false;
            }
        }
        let cur = self.state(f)?.curslot;
        if let Some(c) = cur {
            if self.slots[c].owner != Some(f) {
                self.state_mut(f)?.curslot = None;
            }
        }
        Ok(())
    }

    /// How many distinct files currently hold at least one slot.
    pub fn open_file_count(&self) -> usize {
        let mut count = 0;
        for (i, s) in self.slots.iter().enumerate() {
            if let Some(f) = s.owner {
                if !self.slots[..i].iter().any(|t| t.owner == Some(f)) {
                    count += 1;
                }
            }
        }
        count
    }

    /// The file slot `n` is the current record of, if any.
    pub fn current_file(&self, n: usize) -> Option<FileId> {
        let f = self.slots.get(n)?.owner?;
        let st = self.files.get(f.0)?.as_ref()?;
        if st.curslot == Some(n) {
            Some(f)
        } else {
            None
        }
    }

    /// An element count for batched transfers that will not thrash the
    /// pool: the share of the pool not held by other files, divided by the
    /// element stride (bytes per pixel for images, bytes per row for
    /// tables). At least 1.
    pub fn optimal_chunk(&self, f: FileId) -> Result<usize> {
        let st = self.state(f)?;
        let avail = NBUF.saturating_sub(self.open_file_count()) * BSIZE;
        let stride = match st.hdu.kind {
            HduKind::Image { bitpix } => ((bitpix.abs() / 8) as usize).max(1),
            _ => (st.hdu.rowlength as usize).max(1),
        };
        Ok((avail / stride).max(1))
    }

    /// Checks the structural invariants of the pool. Debug builds call
    /// this from tests; it is not part of the operation contracts.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        // The age index is a permutation of 0..NBUF.
        assert_eq!(self.age.len(), NBUF);
        let mut seen = [false; NBUF];
        for &i in self.age.iter() {
            assert!(!seen[i], "age index repeats slot {}", i);
            seen[i] = true;
        }
        // At most one slot per (file, record).
        for (i, s) in self.slots.iter().enumerate() {
            if let Some(f) = s.owner {
                for t in self.slots[..i].iter() {
                    assert!(
                        t.owner != Some(f) || t.recno != s.recno,
                        "duplicate record in pool"
                    );
                }
            }
        }
        // Current-record pointers point at slots the file owns; sizes are
        // consistent.
        for (i, e) in self.files.iter().enumerate() {
            if let Some(st) = e {
                if let Some(c) = st.curslot {
                    assert_eq!(self.slots[c].owner, Some(FileId(i)));
                }
                assert!(st.logfilesize >= st.filesize);
                assert_eq!(st.logfilesize % BSIZE as u64, 0);
            }
        }
    }
}
