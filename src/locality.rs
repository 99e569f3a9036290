use crate::regs;

/// Per-locality FSM state. All transitions are covered by exhaustive matches
/// at the call sites in `device.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TisState {
    Idle,
    Ready,
    Reception,
    Execution,
    Completion,
}

/// One of the five 4 KiB register pages.
#[derive(Debug, Clone)]
pub struct Locality {
    pub state: TisState,
    pub access: u8,
    pub sts: u32,
    pub iface_id: u32,
    pub inte: u32,
    pub ints: u32,
}

impl Locality {
    /// Reset a single locality to its post-reset defaults. `sts` and
    /// `iface_id` depend on the backend's TPM family and are filled in by
    /// the caller.
    pub fn reset(sts: u32, iface_id: u32) -> Self {
        Locality {
            state: TisState::Idle,
            access: regs::access::TPM_REG_VALID_STS,
            sts,
            iface_id,
            inte: regs::inte::POLARITY_LOW_LEVEL,
            ints: 0,
        }
    }

    /// Set the given flags in STS, clearing everything except the sticky
    /// SELFTEST_DONE and FAMILY bits first.
    pub fn sts_set(&mut self, flags: u32) {
        self.sts &= regs::sts::STICKY_MASK;
        self.sts |= flags;
    }
}
