//! Work requests and completions: small enums plus `bitflags!` sets for
//! the operations and flags this design actually defines.

use bitflags::bitflags;

/// The operation a [`WorkRequest`] asks the executor to perform.
///
/// Only `Write` is implemented end to end; `Read`, `Send`, and `ReadResp`
/// are explicitly unimplemented and always complete with
/// [`CompletionStatus::LocProtErr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Write = 1,
    Read = 2,
    Send = 3,
    ReadResp = 4,
}

bitflags! {
    /// Work-request control flags. `SIGNALED` is the only bit this design
    /// defines; a signaled WR produces a CQE on success, an unsignaled one
    /// does not (errors always produce a CQE regardless).
    #[derive(Default, Clone, Copy)]
    pub struct WrFlags: u8 {
        const SIGNALED = 0x01;
    }
}

/// One posted RDMA operation.
///
/// `local_offset` starts out as an offset into the local MR when the
/// caller builds the WR, but [`crate::qp::QueuePair::post_send`] rewrites
/// it in place to the physical address `mr.paddr + local_offset` before
/// the kernel copy is pushed onto the send queue, so the executor never
/// has to re-resolve it.
#[derive(Debug, Clone, Copy)]
pub struct WorkRequest {
    pub wr_id: u64,
    pub opcode: Opcode,
    pub flags: WrFlags,
    pub local_mr_id: u32,
    pub local_offset: u64,
    pub remote_mr_id: u32,
    pub remote_addr: u64,
    pub remote_key: u32,
    pub length: u32,
}

impl WorkRequest {
    pub fn signaled(&self) -> bool {
        self.flags.contains(WrFlags::SIGNALED)
    }
}

/// Completion status codes reported through a CQE's `status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompletionStatus {
    Success = 0,
    LocProtErr = 1,
    RemAccessErr = 2,
    LocLenErr = 3,
    RemInvReq = 4,
}

/// One completion queue entry.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub wr_id: u64,
    pub byte_len: u32,
    pub status: CompletionStatus,
    pub opcode: Opcode,
}

impl Completion {
    pub(crate) fn error(wr: &WorkRequest, status: CompletionStatus) -> Self {
        debug_assert_ne!(status, CompletionStatus::Success);
        Completion { wr_id: wr.wr_id, byte_len: 0, status, opcode: wr.opcode }
    }

    pub(crate) fn success(wr: &WorkRequest) -> Self {
        Completion { wr_id: wr.wr_id, byte_len: wr.length, status: CompletionStatus::Success, opcode: wr.opcode }
    }
}
