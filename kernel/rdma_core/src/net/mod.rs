//! Ethernet-framed RDMA wire protocol: frame build/parse, the WRITE/ACK
//! exchange, and the inbound dispatch that demultiplexes a frame to its
//! destination QP.

mod wire;

use alloc::vec::Vec;

pub use wire::ETHERTYPE_RDMA;
use wire::{EthernetHeader, RdmaHeader, FLAG_SIGNALED, HEADER_LEN, OP_ACK, OP_WRITE};
use zerocopy::{AsBytes, FromBytes, U16, U32, U64};

use crate::collab::{LinkDevice, MacAddress, PhysicalMemory};
use crate::mr::MrTable;
use crate::qp::{QpState, QpTable};
use crate::wr::{Completion, CompletionStatus, Opcode, WorkRequest};

/// Build a WRITE frame carrying `payload` (the bytes already read from the
/// source MR).
pub fn build_write_frame(
    local_mac: MacAddress,
    remote_mac: MacAddress,
    src_qp: u16,
    dst_qp: u16,
    seq_num: u32,
    wr: &WorkRequest,
    payload: &[u8],
) -> Vec<u8> {
    let eth = EthernetHeader { dst_mac: remote_mac, src_mac: local_mac, ethertype: U16::new(ETHERTYPE_RDMA) };
    let hdr = RdmaHeader {
        opcode: OP_WRITE,
        flags: if wr.signaled() { FLAG_SIGNALED } else { 0 },
        src_qp: U16::new(src_qp),
        dst_qp: U16::new(dst_qp),
        reserved1: U16::new(0),
        seq_num: U32::new(seq_num),
        local_mr_id: U32::new(wr.local_mr_id),
        remote_mr_id: U32::new(wr.remote_mr_id),
        remote_addr: U64::new(wr.remote_addr),
        length: U32::new(wr.length),
        remote_key: U32::new(wr.remote_key),
    };
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(eth.as_bytes());
    frame.extend_from_slice(hdr.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Build an ACK frame for `seq_num`, with no payload and the
/// RDMA-specific fields zeroed.
pub fn build_ack_frame(local_mac: MacAddress, remote_mac: MacAddress, src_qp: u16, dst_qp: u16, seq_num: u32) -> Vec<u8> {
    let eth = EthernetHeader { dst_mac: remote_mac, src_mac: local_mac, ethertype: U16::new(ETHERTYPE_RDMA) };
    let hdr = RdmaHeader {
        opcode: OP_ACK,
        flags: 0,
        src_qp: U16::new(src_qp),
        dst_qp: U16::new(dst_qp),
        reserved1: U16::new(0),
        seq_num: U32::new(seq_num),
        local_mr_id: U32::new(0),
        remote_mr_id: U32::new(0),
        remote_addr: U64::new(0),
        length: U32::new(0),
        remote_key: U32::new(0),
    };
    let mut frame = Vec::with_capacity(HEADER_LEN);
    frame.extend_from_slice(eth.as_bytes());
    frame.extend_from_slice(hdr.as_bytes());
    frame
}

struct ParsedFrame<'a> {
    hdr: RdmaHeader,
    payload: &'a [u8],
}

fn parse_frame(frame: &[u8]) -> Option<ParsedFrame<'_>> {
    if frame.len() < HEADER_LEN {
        return None;
    }
    let eth = EthernetHeader::read_from_prefix(frame)?;
    if eth.ethertype.get() != ETHERTYPE_RDMA {
        return None;
    }
    let hdr = RdmaHeader::read_from_prefix(&frame[core::mem::size_of::<EthernetHeader>()..])?;
    Some(ParsedFrame { hdr, payload: &frame[HEADER_LEN..] })
}

/// Handle an inbound frame of ethertype [`ETHERTYPE_RDMA`]. The embedding
/// NIC driver's receive path is expected to call this for every such
/// frame, passing the source MAC it already parsed off the link layer
/// alongside it -- mirroring `rdma_net_rx(struct mbuf *m, uint8 *src_mac)`
/// in the original, which receives `src_mac` as a caller-supplied argument
/// rather than re-deriving it from the frame. Anything else (unknown
/// `dst_qp`, permission failure, out-of-range `remote_addr`) is silently
/// dropped -- this minimal wire protocol reports errors to nobody.
pub fn rdma_rx(
    qp_table: &QpTable,
    mr_table: &MrTable,
    link: &dyn LinkDevice,
    phys: &dyn PhysicalMemory,
    frame: &[u8],
    src_mac: MacAddress,
) {
    let Some(parsed) = parse_frame(frame) else { return };
    let dst_qp = parsed.hdr.dst_qp.get() as u32;

    match parsed.hdr.opcode {
        OP_WRITE => handle_write(qp_table, mr_table, link, phys, dst_qp, src_mac, &parsed),
        OP_ACK => handle_ack(qp_table, dst_qp, &parsed),
        _ => {}
    }
}

fn handle_write(
    qp_table: &QpTable,
    mr_table: &MrTable,
    link: &dyn LinkDevice,
    phys: &dyn PhysicalMemory,
    dst_qp: u32,
    src_mac: MacAddress,
    parsed: &ParsedFrame<'_>,
) {
    let remote_mr_id = parsed.hdr.remote_mr_id.get();
    let remote_addr = parsed.hdr.remote_addr.get();
    let length = parsed.hdr.length.get();
    let seq_num = parsed.hdr.seq_num.get();
    let src_qp = parsed.hdr.src_qp.get();

    if parsed.payload.len() < length as usize {
        return;
    }

    // Demultiplex to the destination QP and drop if it isn't valid *before*
    // touching any MR (spec §4.5 step 2) -- a bogus dst_qp must not be able
    // to trigger a physical-memory write just because remote_mr_id happens
    // to name a real, permitted MR. This also promotes Rtr -> Rts on first
    // packet, matching the QP-lock-held state transition in the original.
    let qp_present = qp_table
        .with_qp_by_id(dst_qp, |qp| {
            if matches!(qp.state, QpState::Rtr) {
                qp.state = QpState::Rts;
            }
        })
        .is_some();
    if !qp_present {
        return;
    }

    let Some(dst_mr) = mr_table.lookup_by_id(remote_mr_id) else { return };
    if !dst_mr.access_flags.contains(crate::mr::AccessFlags::REMOTE_WRITE) {
        return;
    }
    let Some(offset) = crate::mr::resolve_remote_addr(remote_addr, dst_mr.vaddr as u64, dst_mr.length as u64) else { return };
    let Some(end) = offset.checked_add(length as u64) else { return };
    if end > dst_mr.length as u64 {
        return;
    }

    phys.write(dst_mr.paddr.offset(offset as usize), &parsed.payload[..length as usize]);

    let delivered = qp_table.with_qp_by_id(dst_qp, |qp| {
        let cqe = Completion { wr_id: 0, byte_len: length, status: CompletionStatus::Success, opcode: Opcode::Write };
        let _ = qp.cq.push(cqe);
        qp.stats_completions += 1;
    });
    if delivered.is_none() {
        // the QP was destroyed in the window between the validity check
        // above and the memory write; drop, the same as an unknown dst_qp.
        return;
    }

    let ack = build_ack_frame(link.local_mac(), src_mac, dst_qp as u16, src_qp, seq_num);
    link.transmit(&ack);
}

fn handle_ack(qp_table: &QpTable, dst_qp: u32, parsed: &ParsedFrame<'_>) {
    let seq_num = parsed.hdr.seq_num.get();
    qp_table.with_qp_by_id(dst_qp, |qp| {
        if let Some(wr_id) = qp.resolve_pending_ack(seq_num) {
            let cqe = Completion { wr_id, byte_len: 0, status: CompletionStatus::Success, opcode: Opcode::Write };
            let _ = qp.cq.push(cqe);
            qp.stats_completions += 1;
        }
    });
}
