//! Synchronous work-request dispatch: called inline from `post_send` after
//! a WR lands on the SQ, draining it to empty before `post_send` returns.
//! There is no background thread; the caller of `post_send` pays the cost
//! of dispatch directly.

use alloc::vec::Vec;

use crate::collab::{LinkDevice, PhysicalMemory};
use crate::mr::MrTable;
use crate::net;
use crate::qp::QueuePair;
use crate::wr::{Completion, CompletionStatus, Opcode, WorkRequest};

/// Drain `qp`'s send queue head to tail, dispatching each WR by opcode and
/// by whether the QP is in network mode. One asymmetry: a dispatched
/// network WRITE posts no completion here (its completion arrives later
/// via an ACK), while every other path posts a completion according to
/// the signaled-or-error rule.
///
/// Returns the `local_mr_id` of every WR consumed, for the caller to
/// decrement *after* releasing the QP-table lock this function runs
/// under: §4.6's canonical MR-before-QP order forbids taking the MR lock
/// while the QP lock is held, so the refcount decrement itself must not
/// happen in here (`mr_table.decref` takes the MR lock) even though
/// dispatch's own destination-MR lookups still do, out of necessity.
pub fn drain_send_queue(
    qp_id: u32,
    slots: &mut [crate::qp::QpTableSlot; crate::qp::MAX_QPS],
    mr_table: &MrTable,
    link: &dyn LinkDevice,
    phys: &dyn PhysicalMemory,
) -> Vec<u32> {
    let mut consumed_mr_ids = Vec::new();
    let Some(slot) = slots.get_mut(qp_id as usize) else { return consumed_mr_ids };
    let Some(qp) = slot.qp.as_mut() else { return consumed_mr_ids };

    while let Some(wr) = qp.sq.pop() {
        let completion = dispatch(qp, &wr, mr_table, link, phys);
        qp.outstanding_ops = qp.outstanding_ops.saturating_sub(1);
        consumed_mr_ids.push(wr.local_mr_id);
        if let Some(cqe) = completion {
            let _ = qp.cq.push(cqe);
        }
    }
    consumed_mr_ids
}

fn dispatch(
    qp: &mut QueuePair,
    wr: &WorkRequest,
    mr_table: &MrTable,
    link: &dyn LinkDevice,
    phys: &dyn PhysicalMemory,
) -> Option<Completion> {
    if qp.network_mode && qp.state == crate::qp::QpState::Rts {
        return dispatch_network(qp, wr, mr_table, link, phys);
    }
    dispatch_loopback(wr, mr_table, phys)
}

/// Loopback dispatch: both MRs live in this same table, so the copy
/// happens immediately and a completion is available right away.
fn dispatch_loopback(wr: &WorkRequest, mr_table: &MrTable, phys: &dyn PhysicalMemory) -> Option<Completion> {
    let status = match wr.opcode {
        Opcode::Write => execute_write(wr, mr_table, phys),
        Opcode::Read | Opcode::Send | Opcode::ReadResp => Some(CompletionStatus::LocProtErr),
    };

    match status {
        None => wr.signaled().then(|| Completion::success(wr)),
        Some(status) => Some(Completion::error(wr, status)),
    }
}

/// Apply a WRITE against the destination MR: resolve `remote_addr` (the
/// dual absolute-vs-offset heuristic; see `resolve_remote_addr`),
/// bounds-check, and copy. Returns `None` on success, `Some(status)` on
/// any failure.
fn execute_write(wr: &WorkRequest, mr_table: &MrTable, phys: &dyn PhysicalMemory) -> Option<CompletionStatus> {
    let dst_mr = mr_table.lookup_by_id(wr.remote_mr_id)?;
    if !dst_mr.access_flags.contains(crate::mr::AccessFlags::REMOTE_WRITE) {
        return Some(CompletionStatus::RemAccessErr);
    }

    let offset = crate::mr::resolve_remote_addr(wr.remote_addr, dst_mr.vaddr as u64, dst_mr.length as u64)?;
    if offset.checked_add(wr.length as u64)? > dst_mr.length as u64 {
        return Some(CompletionStatus::RemInvReq);
    }

    // wr.local_offset was already rewritten to a physical address by
    // post_send before this WR was pushed onto the SQ.
    let mut buf = alloc::vec![0u8; wr.length as usize];
    phys.read(crate::collab::PhysicalAddress(wr.local_offset as usize), &mut buf);
    phys.write(dst_mr.paddr.offset(offset as usize), &buf);
    None
}

/// Network dispatch: build and transmit a wire frame, track the pending
/// ACK if signaled, and post no completion — the sender's completion
/// arrives later out of `rdma_rx`'s ACK branch.
fn dispatch_network(
    qp: &mut QueuePair,
    wr: &WorkRequest,
    mr_table: &MrTable,
    link: &dyn LinkDevice,
    phys: &dyn PhysicalMemory,
) -> Option<Completion> {
    if wr.opcode != Opcode::Write {
        return Some(Completion::error(wr, CompletionStatus::LocProtErr));
    }
    if mr_table.lookup_by_id(wr.local_mr_id).is_none() {
        return Some(Completion::error(wr, CompletionStatus::LocProtErr));
    }

    let mut payload = alloc::vec![0u8; wr.length as usize];
    phys.read(crate::collab::PhysicalAddress(wr.local_offset as usize), &mut payload);

    let seq_num = qp.tx_seq_num;
    let frame = net::build_write_frame(
        link.local_mac(),
        qp.remote_mac,
        qp.id as u16,
        qp.remote_qp_num as u16,
        seq_num,
        wr,
        &payload,
    );
    link.transmit(&frame);

    if wr.signaled() {
        qp.track_pending_ack(seq_num, wr.wr_id);
    }
    qp.tx_seq_num = qp.tx_seq_num.wrapping_add(1);
    None
}
