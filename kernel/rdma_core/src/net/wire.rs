//! Wire format for RDMA-over-Ethernet frames: packed, endian-correct wire
//! structs built on `zerocopy::{AsBytes, FromBytes, U16/U32<BigEndian>}`.

use byteorder::BigEndian;
use zerocopy::{AsBytes, FromBytes, U16, U32, U64};

use crate::collab::MacAddress;

/// Ethertype this subsystem claims for its frames.
pub const ETHERTYPE_RDMA: u16 = 0x8915;

pub const OP_WRITE: u8 = 1;
pub const OP_READ: u8 = 2;
pub const OP_READ_RESP: u8 = 3;
pub const OP_ACK: u8 = 4;

pub const FLAG_SIGNALED: u8 = 0x01;

#[repr(C, packed)]
#[derive(AsBytes, FromBytes, Clone, Copy)]
pub struct EthernetHeader {
    pub dst_mac: MacAddress,
    pub src_mac: MacAddress,
    pub ethertype: U16<BigEndian>,
}

/// The RDMA protocol header following the Ethernet header on the wire.
/// The field list below is the part that is actually load-bearing on the
/// wire; it sums to 36 bytes with no padding.
#[repr(C, packed)]
#[derive(AsBytes, FromBytes, Clone, Copy)]
pub struct RdmaHeader {
    pub opcode: u8,
    pub flags: u8,
    pub src_qp: U16<BigEndian>,
    pub dst_qp: U16<BigEndian>,
    pub reserved1: U16<BigEndian>,
    pub seq_num: U32<BigEndian>,
    pub local_mr_id: U32<BigEndian>,
    pub remote_mr_id: U32<BigEndian>,
    pub remote_addr: U64<BigEndian>,
    pub length: U32<BigEndian>,
    pub remote_key: U32<BigEndian>,
}

pub const HEADER_LEN: usize = core::mem::size_of::<EthernetHeader>() + core::mem::size_of::<RdmaHeader>();
