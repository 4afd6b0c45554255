//! Queue-pair state machine and posting path, with the SQ/CQ ring math
//! factored into [`crate::ring::Ring`].

use core::sync::atomic::{fence, Ordering};

use crate::collab::{MacAddress, Owner, Pid, ProcessContext};
use crate::error::{RdmaError, Result};
use crate::executor;
use crate::mr::MrTable;
use crate::ring::Ring;
use crate::wr::{Completion, WorkRequest};

/// Maximum queue pairs system-wide.
pub const MAX_QPS: usize = 16;

/// Number of in-flight send-side ACKs a connected QP can track at once.
pub const MAX_PENDING_ACKS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    Reset,
    Init,
    Rtr,
    Rts,
    Error,
}

/// A send posted over the network awaiting its ACK.
#[derive(Debug, Clone, Copy, Default)]
pub struct PendingAck {
    pub valid: bool,
    pub seq_num: u32,
    pub wr_id: u64,
}

/// A queue pair. Owns its send/completion rings and, once
/// connected, its network session state (sequence numbers and the
/// outstanding-ACK table).
pub struct QueuePair {
    pub id: u32,
    pub owner: Owner,
    pub state: QpState,
    pub sq: Ring<WorkRequest>,
    pub cq: Ring<Completion>,
    pub outstanding_ops: u32,
    pub stats_sends: u64,
    pub stats_completions: u64,
    pub stats_errors: u64,
    pub remote_mac: MacAddress,
    pub remote_qp_num: u32,
    pub connected: bool,
    pub network_mode: bool,
    pub tx_seq_num: u32,
    pub rx_expected_seq: u32,
    pub pending_acks: [PendingAck; MAX_PENDING_ACKS],
}

impl QueuePair {
    fn new(id: u32, owner: Owner, sq_size: u32, cq_size: u32) -> Self {
        QueuePair {
            id,
            owner,
            state: QpState::Init,
            sq: Ring::new(sq_size),
            cq: Ring::new(cq_size),
            outstanding_ops: 0,
            stats_sends: 0,
            stats_completions: 0,
            stats_errors: 0,
            remote_mac: [0; 6],
            remote_qp_num: 0,
            connected: false,
            network_mode: false,
            tx_seq_num: 0,
            rx_expected_seq: 0,
            pending_acks: [PendingAck::default(); MAX_PENDING_ACKS],
        }
    }

    /// Record a signaled network WRITE awaiting its ACK, in the first free
    /// slot. Silently drops the tracking if the table is full: the frame
    /// has already been handed to the NIC by the time this looks for a
    /// slot, so there is no way left to report the failure.
    pub fn track_pending_ack(&mut self, seq_num: u32, wr_id: u64) {
        if let Some(slot) = self.pending_acks.iter_mut().find(|s| !s.valid) {
            *slot = PendingAck { valid: true, seq_num, wr_id };
        }
    }

    /// Resolve and clear a pending ACK by sequence number, returning the
    /// `wr_id` it was tracking.
    pub fn resolve_pending_ack(&mut self, seq_num: u32) -> Option<u64> {
        let slot = self.pending_acks.iter_mut().find(|s| s.valid && s.seq_num == seq_num)?;
        slot.valid = false;
        Some(slot.wr_id)
    }
}

/// The largest power-of-two entry count of a `T`-element ring that still
/// fits in one page — the real per-entry-type ceiling (spec §4.2), as
/// opposed to the flat `sq_size <= 1024`/`cq_size <= 1024` the syscall
/// shim pre-filters with before ever calling into this core.
fn max_ring_entries<T>(page_size: usize) -> u32 {
    let max_entries = page_size / core::mem::size_of::<T>();
    if max_entries == 0 {
        return 0;
    }
    1u32 << (31 - (max_entries as u32).leading_zeros())
}

/// Largest SQ depth (in [`WorkRequest`] entries) that fits one page.
pub fn max_sq_ring_size(page_size: usize) -> u32 {
    max_ring_entries::<WorkRequest>(page_size)
}

/// Largest CQ depth (in [`Completion`] entries) that fits one page.
pub fn max_cq_ring_size(page_size: usize) -> u32 {
    max_ring_entries::<Completion>(page_size)
}

/// Validates a caller-given SQ size: must be a non-zero power of two, and
/// no larger than the number of [`WorkRequest`] entries that fit in one
/// page.
pub fn validate_sq_ring_size(size: u32, page_size: usize) -> Result<()> {
    if size == 0 || !size.is_power_of_two() || size > max_sq_ring_size(page_size) {
        return Err(RdmaError::InvalidArg);
    }
    Ok(())
}

/// Validates a caller-given CQ size: must be a non-zero power of two, and
/// no larger than the number of [`Completion`] entries that fit in one
/// page.
pub fn validate_cq_ring_size(size: u32, page_size: usize) -> Result<()> {
    if size == 0 || !size.is_power_of_two() || size > max_cq_ring_size(page_size) {
        return Err(RdmaError::InvalidArg);
    }
    Ok(())
}

#[derive(Default)]
pub struct QpTableSlot {
    pub(crate) qp: Option<QueuePair>,
}

/// The process-wide QP table.
pub struct QpTable {
    slots: spin::Mutex<[QpTableSlot; MAX_QPS]>,
}

impl Default for QpTable {
    fn default() -> Self {
        Self::new()
    }
}

impl QpTable {
    pub fn new() -> Self {
        QpTable { slots: spin::Mutex::new(core::array::from_fn(|_| QpTableSlot::default())) }
    }

    /// Create a QP with the given SQ/CQ depths, starting directly in
    /// `Init` state: nothing observable happens while briefly in `Reset`,
    /// so this folds the two steps into one.
    pub fn create(&self, ctx: &dyn ProcessContext, sq_size: u32, cq_size: u32) -> Result<u32> {
        let page_size = ctx.page_size();
        validate_sq_ring_size(sq_size, page_size)?;
        validate_cq_ring_size(cq_size, page_size)?;
        let mut slots = self.slots.lock();
        let index = slots.iter().position(|s| s.qp.is_none()).ok_or(RdmaError::NoSlots)?;
        let id = index as u32;
        slots[index].qp = Some(QueuePair::new(id, Owner::of(ctx), sq_size, cq_size));
        log::trace!("qp: created QP {id} for pid {:?}", ctx.pid());
        Ok(id)
    }

    /// Destroy a QP. Warns but proceeds even with `outstanding_ops > 0`
    /// rather than refusing (see DESIGN.md: a terminating process
    /// shouldn't be blocked on the networking stack's idea of in-flight
    /// work).
    pub fn destroy(&self, ctx: &dyn ProcessContext, qp_id: u32) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = slot_mut(&mut slots, qp_id)?;
        let qp = slot.qp.as_ref().ok_or(RdmaError::InvalidArg)?;
        if !qp.owner.is(ctx) {
            return Err(RdmaError::NotOwned);
        }
        if qp.outstanding_ops > 0 {
            log::warn!("qp: destroying QP {qp_id} with {} outstanding ops", qp.outstanding_ops);
        }
        slot.qp = None;
        Ok(())
    }

    /// Move a QP straight from `Init` to `Rts`, recording the peer's MAC
    /// and QP number and arming sequence-number tracking. A richer RDMA
    /// implementation would pass through `Rtr` as a separate step; this
    /// one collapses the two, by design (see DESIGN.md).
    pub fn connect(&self, ctx: &dyn ProcessContext, qp_id: u32, remote_mac: MacAddress, remote_qp_num: u32) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = slot_mut(&mut slots, qp_id)?;
        let qp = slot.qp.as_mut().ok_or(RdmaError::InvalidArg)?;
        if !qp.owner.is(ctx) {
            return Err(RdmaError::NotOwned);
        }
        if qp.state != QpState::Init {
            return Err(RdmaError::BadState);
        }
        qp.remote_mac = remote_mac;
        qp.remote_qp_num = remote_qp_num;
        qp.network_mode = true;
        qp.connected = true;
        qp.tx_seq_num = 1;
        qp.rx_expected_seq = 1;
        qp.state = QpState::Rts;
        log::trace!("qp: QP {qp_id} connected to {remote_mac:02x?}/{remote_qp_num}");
        Ok(())
    }

    /// Post a work request. Lock ordering is MR-then-QP: `post_send` must
    /// bump the source MR's refcount before the work is visible on the
    /// SQ, and undo it if the SQ turns out to be full.
    pub fn post_send(
        &self,
        ctx: &dyn ProcessContext,
        mr_table: &MrTable,
        link: &dyn crate::collab::LinkDevice,
        phys: &dyn crate::collab::PhysicalMemory,
        qp_id: u32,
        mut wr: WorkRequest,
    ) -> Result<()> {
        // lookup, bounds-check, and refcount++ happen as one critical section
        // (spec §4.3 "holding MR lock"): splitting these across two lock
        // acquisitions would let the MR be deregistered and its slot reused
        // in between, landing the increment on a different registration.
        let src_mr = mr_table.lookup_and_incref(ctx, wr.local_mr_id, wr.local_offset as usize, wr.length as usize)?;
        let physical_offset = src_mr.paddr.offset(wr.local_offset as usize);
        wr.local_offset = physical_offset.0 as u64;

        let mut slots = self.slots.lock();
        let result = (|| {
            let slot = slot_mut(&mut slots, qp_id)?;
            let qp = slot.qp.as_mut().ok_or(RdmaError::InvalidArg)?;
            if !qp.owner.is(ctx) {
                return Err(RdmaError::NotOwned);
            }
            if !matches!(qp.state, QpState::Init | QpState::Rtr | QpState::Rts) {
                return Err(RdmaError::BadState);
            }
            if qp.sq.push(wr).is_err() {
                qp.stats_errors += 1;
                return Err(RdmaError::QueueFull);
            }
            qp.outstanding_ops += 1;
            qp.stats_sends += 1;
            fence(Ordering::SeqCst);
            Ok(())
        })();

        if result.is_err() {
            drop(slots);
            mr_table.decref(src_mr.id);
            return result;
        }

        // §4.6: the MR lock must never be taken while the QP lock (held as
        // `slots` here) is still held. drain_send_queue only collects the
        // local_mr_id of each consumed WR; the decrement itself happens
        // below, after `slots` drops.
        let consumed_mr_ids = executor::drain_send_queue(qp_id, &mut slots, mr_table, link, phys);
        drop(slots);
        for mr_id in consumed_mr_ids {
            mr_table.decref(mr_id);
        }
        Ok(())
    }

    /// Drain up to `out.len()` completions from `qp_id`'s CQ.
    pub fn poll_cq(&self, ctx: &dyn ProcessContext, qp_id: u32, out: &mut [Completion]) -> Result<usize> {
        let mut slots = self.slots.lock();
        let slot = slot_mut(&mut slots, qp_id)?;
        let qp = slot.qp.as_mut().ok_or(RdmaError::InvalidArg)?;
        if !qp.owner.is(ctx) {
            return Err(RdmaError::NotOwned);
        }
        fence(Ordering::SeqCst);
        let mut n = 0;
        while n < out.len() {
            match qp.cq.pop() {
                Some(cqe) => {
                    if cqe.status != crate::wr::CompletionStatus::Success {
                        qp.stats_errors += 1;
                    }
                    qp.stats_completions += 1;
                    out[n] = cqe;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    /// Run `f` against the QP identified by `qp_id`, regardless of owner,
    /// for use by the network RX path which has no caller `ProcessContext`
    /// — the NIC driver delivers frames, not a process.
    pub fn with_qp_by_id<R>(&self, qp_id: u32, f: impl FnOnce(&mut QueuePair) -> R) -> Option<R> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(qp_id as usize)?;
        slot.qp.as_mut().map(f)
    }

    /// Reclaim every QP owned by `pid`, mirroring
    /// [`crate::mr::MrTable::release_all_for`].
    pub fn release_all_for(&self, pid: Pid) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if slot.qp.as_ref().is_some_and(|qp| qp.owner.pid == pid) {
                slot.qp = None;
            }
        }
    }
}

fn slot_mut(slots: &mut [QpTableSlot; MAX_QPS], qp_id: u32) -> Result<&mut QpTableSlot> {
    slots.get_mut(qp_id as usize).ok_or(RdmaError::InvalidArg)
}
