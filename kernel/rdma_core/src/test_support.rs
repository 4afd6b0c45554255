//! Software test doubles for [`crate::collab::ProcessContext`],
//! [`crate::collab::LinkDevice`], and [`crate::collab::PhysicalMemory`],
//! used only by `#[cfg(test)]` modules throughout the crate: small
//! in-crate fakes driven directly by colocated tests rather than a
//! mocking framework.

#![cfg(test)]

extern crate std;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::collab::{LinkDevice, MacAddress, PhysicalAddress, PhysicalMemory, Pid, ProcessContext, ProcessHandle};

/// A `ProcessContext` backed by a flat byte buffer standing in for a user
/// address space: `translate(vaddr)` trivially maps `vaddr` to the same
/// offset in a shared physical arena, i.e. identity-mapped, which is all
/// the executor's MR math needs to exercise.
pub struct TestProcess {
    pid: Pid,
    handle: ProcessHandle,
    user_size: usize,
}

impl TestProcess {
    pub fn new(pid: u32, user_size: usize) -> Self {
        TestProcess { pid: Pid(pid), handle: ProcessHandle(pid as u64), user_size }
    }

    pub fn with_handle(pid: u32, user_size: usize, handle: u64) -> Self {
        TestProcess { pid: Pid(pid), handle: ProcessHandle(handle), user_size }
    }
}

impl ProcessContext for TestProcess {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn handle(&self) -> ProcessHandle {
        self.handle
    }

    fn user_size_bytes(&self) -> usize {
        self.user_size
    }

    fn translate(&self, vaddr: usize) -> Option<PhysicalAddress> {
        if vaddr >= self.user_size {
            None
        } else {
            // offset every process's space so two processes' "physical"
            // ranges never collide in the shared arena used by tests;
            // 16 MiB per pid comfortably exceeds any user_size used below
            Some(PhysicalAddress(self.pid.0 as usize * (1 << 24) + vaddr))
        }
    }
}

/// A flat, lock-guarded byte arena playing the role of physical memory.
/// Large enough to hold every `TestProcess`'s identity-mapped-with-offset
/// range used across the test suite.
pub struct TestMemory {
    bytes: Mutex<Vec<u8>>,
}

impl TestMemory {
    pub fn new(size: usize) -> Self {
        TestMemory { bytes: Mutex::new(vec![0u8; size]) }
    }
}

impl PhysicalMemory for TestMemory {
    fn read(&self, paddr: PhysicalAddress, buf: &mut [u8]) {
        let mem = self.bytes.lock();
        buf.copy_from_slice(&mem[paddr.0..paddr.0 + buf.len()]);
    }

    fn write(&self, paddr: PhysicalAddress, buf: &[u8]) {
        let mut mem = self.bytes.lock();
        mem[paddr.0..paddr.0 + buf.len()].copy_from_slice(buf);
    }
}

/// A loopback (or cross-instance) `LinkDevice`: frames handed to
/// `transmit` are appended to a shared inbox that a test drains and feeds
/// back into the peer's `rdma_rx`, modeling the N1/N2 two-host scenarios
/// without a real NIC.
#[derive(Clone)]
pub struct TestLink {
    mac: MacAddress,
    inbox: Arc<Mutex<Vec<(Vec<u8>, MacAddress)>>>,
}

impl TestLink {
    pub fn new(mac: MacAddress) -> Self {
        TestLink { mac, inbox: Arc::new(Mutex::new(Vec::new())) }
    }

    /// A second endpoint sharing this link's wire, with a different MAC.
    pub fn peer(&self, mac: MacAddress) -> Self {
        TestLink { mac, inbox: self.inbox.clone() }
    }

    /// Drain every frame transmitted on this link so far.
    pub fn drain(&self) -> Vec<(Vec<u8>, MacAddress)> {
        core::mem::take(&mut self.inbox.lock())
    }
}

impl LinkDevice for TestLink {
    fn transmit(&self, frame: &[u8]) {
        self.inbox.lock().push((frame.to_vec(), self.mac));
    }

    fn local_mac(&self) -> MacAddress {
        self.mac
    }
}
