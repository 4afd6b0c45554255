//! Memory-Region registry. A fixed-size table of pinned,
//! permission-tagged user memory spans, guarded by a single `spin::Mutex`
//! in place of `std::sync` for `no_std` code.

use bitflags::bitflags;
use spin::Mutex;

use crate::collab::{Owner, PhysicalAddress, Pid, ProcessContext};
use crate::error::{RdmaError, Result};

/// Maximum memory regions system-wide.
pub const MAX_MRS: usize = 64;

bitflags! {
    /// Permission bits on a memory region: a small, deliberately trimmed
    /// vocabulary next to the larger bit sets real verbs APIs define.
    #[derive(Default, Clone, Copy)]
    pub struct AccessFlags: u8 {
        const LOCAL_READ = 0x01;
        const LOCAL_WRITE = 0x02;
        const REMOTE_READ = 0x04;
        const REMOTE_WRITE = 0x08;
    }
}

/// A registered, pinned memory region.
///
/// `lkey`/`rkey` both equal `id`: this design simplifies away real
/// memory-key cryptographic protection.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub id: u32,
    pub owner: Owner,
    pub vaddr: usize,
    pub paddr: PhysicalAddress,
    pub length: usize,
    pub access_flags: AccessFlags,
    pub refcount: u32,
}

impl MemoryRegion {
    pub fn lkey(&self) -> u32 {
        self.id
    }

    pub fn rkey(&self) -> u32 {
        self.id
    }
}

#[derive(Default)]
struct Slot {
    mr: Option<MemoryRegion>,
}

/// The process-wide MR table: one mutex-guarded fixed-size array.
pub struct MrTable {
    slots: Mutex<[Slot; MAX_MRS]>,
}

impl Default for MrTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MrTable {
    pub fn new() -> Self {
        MrTable { slots: Mutex::new(core::array::from_fn(|_| Slot::default())) }
    }

    /// Register a new MR spanning `[vaddr, vaddr + length)` in the
    /// caller's address space. Fails with [`RdmaError::InvalidArg`] if the
    /// range is null-length, out of bounds, or crosses a page boundary;
    /// with [`RdmaError::NoSlots`] if the table is full.
    pub fn register(&self, ctx: &dyn ProcessContext, vaddr: usize, length: usize, access_flags: AccessFlags) -> Result<u32> {
        if vaddr == 0 || length == 0 {
            return Err(RdmaError::InvalidArg);
        }
        let user_size = ctx.user_size_bytes();
        if vaddr >= user_size || vaddr.checked_add(length).map_or(true, |end| end > user_size) {
            return Err(RdmaError::InvalidArg);
        }
        let page_size = ctx.page_size();
        let start_page = page_of(vaddr, page_size);
        let end_page = page_of(vaddr + length - 1, page_size);
        if start_page != end_page {
            return Err(RdmaError::InvalidArg);
        }

        let mut slots = self.slots.lock();
        let index = slots.iter().position(|s| s.mr.is_none()).ok_or(RdmaError::NoSlots)?;

        let paddr = ctx.translate(vaddr).ok_or(RdmaError::InvalidArg)?;
        let id = (index + 1) as u32;
        slots[index].mr = Some(MemoryRegion {
            id,
            owner: Owner::of(ctx),
            vaddr,
            paddr,
            length,
            access_flags,
            refcount: 0,
        });
        log::trace!("mr: registered MR {id} for pid {:?}: vaddr={vaddr:#x} len={length} flags={access_flags:?}", ctx.pid());
        Ok(id)
    }

    /// Deregister `mr_id`. Fails with [`RdmaError::NotOwned`] if the
    /// caller isn't the owner (pointer/handle and pid both checked, to
    /// guard against pid reuse after the owner exited), or
    /// [`RdmaError::Busy`] if operations are still in flight.
    pub fn deregister(&self, ctx: &dyn ProcessContext, mr_id: u32) -> Result<()> {
        let index = mr_index(mr_id)?;
        let mut slots = self.slots.lock();
        let mr = slots[index].mr.as_ref().ok_or(RdmaError::InvalidArg)?;
        if !mr.owner.is(ctx) {
            return Err(RdmaError::NotOwned);
        }
        if mr.refcount > 0 {
            return Err(RdmaError::Busy);
        }
        slots[index].mr = None;
        log::trace!("mr: deregistered MR {mr_id}");
        Ok(())
    }

    /// Look up `mr_id`, returning it only if valid and owned by the
    /// caller. Used by `post_send` to validate the *local*
    /// MR; destination-MR lookups during dispatch use
    /// [`MrTable::lookup_by_id`] instead, since the destination MR may
    /// belong to a different process in the same loopback test harness.
    pub fn lookup(&self, ctx: &dyn ProcessContext, mr_id: u32) -> Option<MemoryRegion> {
        let index = mr_index(mr_id).ok()?;
        let slots = self.slots.lock();
        let mr = slots[index].mr?;
        mr.owner.is(ctx).then_some(mr)
    }

    /// Look up `mr_id` owned by the given `Owner`, without requiring a
    /// live `ProcessContext` for that owner. Used when a loopback WRITE's
    /// destination MR belongs to the same process as the source (the
    /// executor already has that process's `Owner` from the source MR),
    /// and when the network RX path resolves a destination MR by id
    /// alone (the peer only sends the id, not ownership proof).
    pub fn lookup_by_id(&self, mr_id: u32) -> Option<MemoryRegion> {
        let index = mr_index(mr_id).ok()?;
        self.slots.lock()[index].mr
    }

    /// Look up `mr_id`, bounds-check `[offset, offset + length)` against
    /// it, and bump its refcount — all under one lock acquisition. Used by
    /// `post_send` for the source MR: doing the lookup and the refcount
    /// increment as two separate acquisitions would let the MR be
    /// deregistered and its slot reused for a different MR in between,
    /// so the increment would land on the wrong registration.
    pub fn lookup_and_incref(&self, ctx: &dyn ProcessContext, mr_id: u32, offset: usize, length: usize) -> Result<MemoryRegion> {
        let index = mr_index(mr_id)?;
        let mut slots = self.slots.lock();
        let mr = slots[index].mr.as_mut().ok_or(RdmaError::InvalidArg)?;
        if !mr.owner.is(ctx) {
            return Err(RdmaError::InvalidArg);
        }
        if offset.checked_add(length).map_or(true, |end| end > mr.length) {
            return Err(RdmaError::InvalidArg);
        }
        mr.refcount += 1;
        Ok(*mr)
    }

    pub fn incref(&self, mr_id: u32) {
        let index = match mr_index(mr_id) {
            Ok(i) => i,
            Err(_) => return,
        };
        if let Some(mr) = self.slots.lock()[index].mr.as_mut() {
            mr.refcount += 1;
        }
    }

    pub fn decref(&self, mr_id: u32) {
        let index = match mr_index(mr_id) {
            Ok(i) => i,
            Err(_) => return,
        };
        if let Some(mr) = self.slots.lock()[index].mr.as_mut() {
            mr.refcount = mr.refcount.saturating_sub(1);
        }
    }

    /// Reclaim every MR owned by `pid`, regardless of in-flight
    /// operations. The embedding kernel's process-exit path is expected to
    /// call this, or slots leak forever when a process dies without
    /// deregistering.
    pub fn release_all_for(&self, pid: Pid) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if slot.mr.is_some_and(|mr| mr.owner.pid == pid) {
                slot.mr = None;
            }
        }
    }
}

fn page_of(addr: usize, page_size: usize) -> usize {
    addr & !(page_size - 1)
}

/// Resolve a peer-supplied `remote_addr` against a destination MR, which
/// this design accepts in either of two forms: an absolute virtual address
/// within the MR's range, or a bare byte offset into it. Returns `None` if
/// neither interpretation fits. Shared by the loopback executor and the
/// network RX path, which both need the exact same ambiguity preserved
/// rather than resolved — a future protocol revision should pick one
/// interpretation instead of guessing.
pub(crate) fn resolve_remote_addr(remote_addr: u64, dst_vaddr: u64, dst_length: u64) -> Option<u64> {
    if remote_addr >= dst_vaddr && remote_addr < dst_vaddr + dst_length {
        Some(remote_addr - dst_vaddr)
    } else if remote_addr < dst_length {
        Some(remote_addr)
    } else {
        None
    }
}


fn mr_index(mr_id: u32) -> Result<usize> {
    if mr_id == 0 || mr_id as usize > MAX_MRS {
        return Err(RdmaError::InvalidArg);
    }
    Ok(mr_id as usize - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestProcess;

    #[test]
    fn register_then_deregister_frees_the_slot() {
        let table = MrTable::new();
        let proc = TestProcess::new(1, 64 * 1024);
        let id = table.register(&proc, 4096, 256, AccessFlags::LOCAL_READ).unwrap();
        table.deregister(&proc, id).unwrap();
        // the slot must be reusable immediately (scenario/invariant 4)
        let id2 = table.register(&proc, 4096, 256, AccessFlags::LOCAL_READ).unwrap();
        assert_eq!(id, id2);
    }

    #[test]
    fn crossing_a_page_boundary_is_rejected() {
        let table = MrTable::new();
        let proc = TestProcess::new(1, 64 * 1024);
        let err = table.register(&proc, 4096 - 100, 200, AccessFlags::LOCAL_READ).unwrap_err();
        assert_eq!(err, RdmaError::InvalidArg);
    }

    #[test]
    fn exact_page_fill_succeeds_one_byte_offset_fails() {
        let table = MrTable::new();
        let proc = TestProcess::new(1, 64 * 1024);
        assert!(table.register(&proc, 4096, 4096, AccessFlags::LOCAL_READ).is_ok());
        let table2 = MrTable::new();
        let err = table2.register(&proc, 4096 + 1, 4096, AccessFlags::LOCAL_READ).unwrap_err();
        assert_eq!(err, RdmaError::InvalidArg);
    }

    #[test]
    fn busy_mr_refuses_deregister_until_refcount_drops() {
        let table = MrTable::new();
        let proc = TestProcess::new(1, 64 * 1024);
        let id = table.register(&proc, 4096, 256, AccessFlags::LOCAL_READ).unwrap();
        table.incref(id);
        assert_eq!(table.deregister(&proc, id).unwrap_err(), RdmaError::Busy);
        table.decref(id);
        assert!(table.deregister(&proc, id).is_ok());
    }

    #[test]
    fn other_process_cannot_deregister_or_lookup() {
        let table = MrTable::new();
        let owner = TestProcess::new(1, 64 * 1024);
        let intruder = TestProcess::new(2, 64 * 1024);
        let id = table.register(&owner, 4096, 256, AccessFlags::LOCAL_READ).unwrap();
        assert!(table.lookup(&intruder, id).is_none());
        assert_eq!(table.deregister(&intruder, id).unwrap_err(), RdmaError::NotOwned);
    }

    #[test]
    fn pid_reuse_does_not_inherit_ownership() {
        let table = MrTable::new();
        let first = TestProcess::new(7, 64 * 1024);
        let id = table.register(&first, 4096, 256, AccessFlags::LOCAL_READ).unwrap();
        // same pid, new process instance (simulating pid reuse after exit)
        let reused = TestProcess::with_handle(7, 64 * 1024, 999);
        assert_eq!(table.deregister(&reused, id).unwrap_err(), RdmaError::NotOwned);
    }

    #[test]
    fn table_exhaustion_returns_no_slots() {
        let table = MrTable::new();
        let proc = TestProcess::new(1, 1 << 20);
        for i in 0..MAX_MRS {
            table.register(&proc, (i + 1) * 4096, 64, AccessFlags::LOCAL_READ).unwrap();
        }
        let err = table.register(&proc, (MAX_MRS + 1) * 4096, 64, AccessFlags::LOCAL_READ).unwrap_err();
        assert_eq!(err, RdmaError::NoSlots);
    }

    #[test]
    fn release_all_for_frees_only_the_dead_pids_mrs() {
        let table = MrTable::new();
        let dying = TestProcess::new(1, 1 << 20);
        let survivor = TestProcess::new(2, 1 << 20);
        let dead_id = table.register(&dying, 4096, 64, AccessFlags::LOCAL_READ).unwrap();
        let alive_id = table.register(&survivor, 4096, 64, AccessFlags::LOCAL_READ).unwrap();

        table.release_all_for(dying.pid());

        assert!(table.lookup(&dying, dead_id).is_none());
        assert!(table.lookup(&survivor, alive_id).is_some());
        // the freed slot is reusable immediately
        let reused_id = table.register(&dying, 4096, 64, AccessFlags::LOCAL_READ).unwrap();
        assert_eq!(reused_id, dead_id);
    }
}
