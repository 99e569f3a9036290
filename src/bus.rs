use std::io;
use std::sync::{Arc, Barrier};

/// Stand-in for the host VMM's MMIO bus-device trait. A real integration
/// wires `TpmTis` onto its bus by implementing the bus's own trait in terms
/// of these two methods; we keep the same two-method shape here so that
/// wiring is a thin adapter rather than a rewrite.
pub trait MmioDevice {
    /// Handle a guest read of `data.len()` bytes (1, 2, or 4) at `base + offset`.
    fn read(&mut self, base: u64, offset: u64, data: &mut [u8]);

    /// Handle a guest write of `data.len()` bytes (1, 2, or 4) at `base + offset`.
    /// Returns a barrier the caller must wait on before resuming the vCPU, if
    /// the write needs to rendezvous with another thread. This device never
    /// needs one.
    fn write(&mut self, base: u64, offset: u64, data: &[u8]) -> Option<Arc<Barrier>>;
}

/// Stand-in for the host platform's interrupt line. `trigger` asserts the
/// line; level-triggered semantics (asserting vs. deasserting) are expressed
/// with `index`: `0` raises, and a real platform binding exposes an explicit
/// deassert. This device only ever raises through `trigger` -- INT_STATUS
/// writes are what drive `deassert`.
pub trait InterruptLine {
    fn trigger(&self, index: usize) -> io::Result<()>;
    fn deassert(&self, index: usize) -> io::Result<()>;
}
