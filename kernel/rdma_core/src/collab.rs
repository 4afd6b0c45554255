//! Trait boundaries standing in for the collaborators this subsystem treats
//! as out of scope: the page-table walk, the per-process address space, and
//! the NIC's transmit/identity surface.
//!
//! The core never assumes a concrete kernel; it is handed a `ProcessContext`
//! per call (standing in for `myproc()` + `vaddr_walk`) and a `LinkDevice`
//! at construction time (standing in for `link_tx`/`link_local_mac`).

/// Process identifier, captured at MR/QP registration time so that a
/// reused pid after the owner exits cannot be mistaken for the original
/// owner (see [`ProcessHandle`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

/// Opaque, non-owning reference to a process table slot. Two processes
/// that happen to share a [`Pid`] (because the kernel recycled it) must
/// never compare equal here; the embedding kernel is expected to derive
/// this from something like a slot generation counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle(pub u64);

/// A physical address, opaque to everything except the caller that
/// produced it via [`ProcessContext::translate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalAddress(pub usize);

impl PhysicalAddress {
    pub fn offset(self, by: usize) -> Self {
        PhysicalAddress(self.0 + by)
    }
}

/// A 48-bit Ethernet MAC address.
pub type MacAddress = [u8; 6];

/// The caller's identity and address-space services, standing in for
/// `proc_current()` and `vaddr_walk()`.
///
/// Every entry point that touches ownership or translates a user address
/// takes `&dyn ProcessContext` for "the calling process" rather than
/// reaching for a kernel-global `myproc()`, so the crate stays testable
/// and free of an implicit global.
pub trait ProcessContext {
    /// The calling process's pid.
    fn pid(&self) -> Pid;

    /// An opaque handle identifying this process instance, distinct from
    /// any later process that reuses the same pid.
    fn handle(&self) -> ProcessHandle;

    /// Size in bytes of the caller's user address space.
    fn user_size_bytes(&self) -> usize;

    /// Translate a user virtual address into a physical address by
    /// walking the caller's page table. Returns `None` if the page is
    /// unmapped.
    fn translate(&self, vaddr: usize) -> Option<PhysicalAddress>;

    /// The page size of the caller's address space, used to enforce the
    /// one-page-per-MR invariant.
    fn page_size(&self) -> usize {
        4096
    }
}

/// The owner identity recorded in an MR or QP slot: enough to check
/// "is the caller still the same process that registered this" without
/// holding a live reference to a process struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub pid: Pid,
    pub handle: ProcessHandle,
}

impl Owner {
    pub fn of(ctx: &dyn ProcessContext) -> Self {
        Owner { pid: ctx.pid(), handle: ctx.handle() }
    }

    pub fn is(&self, ctx: &dyn ProcessContext) -> bool {
        self.pid == ctx.pid() && self.handle == ctx.handle()
    }
}

/// The NIC transmit/identity surface, standing in for `link_tx` and
/// `link_local_mac()`. `link_rx` is the reverse direction: the
/// embedding NIC driver is expected to call [`crate::RdmaCore::rdma_rx`]
/// for every frame of ethertype [`crate::net::ETHERTYPE_RDMA`].
pub trait LinkDevice {
    /// Hand a fully-built frame (Ethernet header onward) to the NIC for
    /// transmission. Non-blocking; drop-on-overflow is acceptable.
    fn transmit(&self, frame: &[u8]);

    /// This host's MAC address, used as the Ethernet source address and
    /// recorded by peers as the `remote_mac` to connect back to.
    fn local_mac(&self) -> MacAddress;
}

/// Byte-addressable access to physical memory by [`PhysicalAddress`],
/// standing in for the direct pointer dereferences a kernel would perform
/// on a `paddr` once `vaddr_walk` has resolved it. `ProcessContext`
/// resolves *which* physical address a virtual one maps to; this trait is
/// what actually moves bytes there, since a `PhysicalAddress` on its own
/// carries no memory behind it in a `no_std`, kernel-agnostic crate.
///
/// The executor copies between two MRs that may belong to different
/// processes (or, on the network RX path, no local process at all), so
/// this is held once by [`crate::RdmaCore`] rather than threaded through
/// per-call like `ProcessContext`.
pub trait PhysicalMemory {
    fn read(&self, paddr: PhysicalAddress, buf: &mut [u8]);
    fn write(&self, paddr: PhysicalAddress, buf: &[u8]);
}
