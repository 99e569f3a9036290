//! Register offsets and bit layouts for a single locality page.

pub const NUM_LOCALITIES: u8 = 5;
pub const NO_LOCALITY: u8 = 0xff;
pub const LOCALITY_SHIFT: u64 = 12;
pub const BUFFER_MAX: usize = 4096;

/// Offsets within a locality's 4 KiB page.
pub const REG_ACCESS: u64 = 0x000;
pub const REG_INT_ENABLE: u64 = 0x008;
pub const REG_INT_VECTOR: u64 = 0x00c;
pub const REG_INT_STATUS: u64 = 0x010;
pub const REG_INTF_CAPABILITY: u64 = 0x014;
pub const REG_STS: u64 = 0x018;
pub const REG_DATA_FIFO: u64 = 0x024;
pub const REG_INTERFACE_ID: u64 = 0x030;
pub const REG_DATA_XFIFO: u64 = 0x080;
pub const REG_DATA_XFIFO_END: u64 = 0x0bc;
pub const REG_DID_VID: u64 = 0xf00;
pub const REG_RID: u64 = 0xf04;

pub mod access {
    pub const TPM_ESTABLISHMENT: u8 = 1 << 0;
    pub const REQUEST_USE: u8 = 1 << 1;
    pub const PENDING_REQUEST: u8 = 1 << 2;
    pub const SEIZE: u8 = 1 << 3;
    pub const BEEN_SEIZED: u8 = 1 << 4;
    pub const ACTIVE_LOCALITY: u8 = 1 << 5;
    pub const TPM_REG_VALID_STS: u8 = 1 << 7;
}

pub mod sts {
    pub const RESPONSE_RETRY: u32 = 1 << 1;
    pub const SELFTEST_DONE: u32 = 1 << 2;
    pub const EXPECT: u32 = 1 << 3;
    pub const DATA_AVAILABLE: u32 = 1 << 4;
    pub const TPM_GO: u32 = 1 << 5;
    pub const COMMAND_READY: u32 = 1 << 6;
    pub const VALID: u32 = 1 << 7;
    pub const BURST_COUNT_SHIFT: u32 = 8;
    pub const COMMAND_CANCEL: u32 = 1 << 24;
    pub const RESET_ESTABLISHMENT_BIT: u32 = 1 << 25;
    pub const FAMILY_MASK: u32 = 0x3 << 26;
    pub const FAMILY_1_2: u32 = 0 << 26;
    pub const FAMILY_2_0: u32 = 1 << 26;
    /// Bits preserved by `sts_set` across a full-register rewrite.
    pub const STICKY_MASK: u32 = SELFTEST_DONE | FAMILY_MASK;
    /// Mask of bits a guest write to STS is allowed to carry.
    pub const WRITABLE_COMMAND_MASK: u32 = COMMAND_READY | TPM_GO | RESPONSE_RETRY;
}

pub mod inte {
    pub const DATA_AVAILABLE: u32 = 1 << 0;
    pub const STS_VALID: u32 = 1 << 1;
    pub const LOCALITY_CHANGED: u32 = 1 << 2;
    pub const POLARITY_MASK: u32 = 0x3 << 3;
    pub const POLARITY_LOW_LEVEL: u32 = 1 << 3;
    pub const COMMAND_READY: u32 = 1 << 7;
    pub const INT_ENABLED: u32 = 1 << 31;
    pub const INTERRUPTS_SUPPORTED: u32 =
        DATA_AVAILABLE | STS_VALID | LOCALITY_CHANGED | COMMAND_READY;
}

pub mod ints {
    pub const DATA_AVAILABLE: u32 = super::inte::DATA_AVAILABLE;
    pub const STS_VALID: u32 = super::inte::STS_VALID;
    pub const LOCALITY_CHANGED: u32 = super::inte::LOCALITY_CHANGED;
    pub const COMMAND_READY: u32 = super::inte::COMMAND_READY;
}

pub mod iface_id {
    pub const INT_SEL_LOCK: u32 = 1 << 19;

    /// TPM2.0 FIFO interface descriptor: interface=FIFO(0), version=0,
    /// 5 localities supported (bit 8), TIS interface supported (bit 13).
    pub const SUPPORTED_FLAGS_2_0: u32 = (0 << 4) | (1 << 8) | (1 << 13);
    /// TPM1.2 carries no INTERFACE_ID payload beyond the lock bit.
    pub const SUPPORTED_FLAGS_1_2: u32 = 0;
}

pub mod intf_capability {
    /// TPM2.0: interface version (TIS1.3-superset) = 3, 64B data transfer,
    /// dynamic burst count, low-level interrupt supported, plus the
    /// supported-interrupts mask.
    pub const SUPPORTED_2_0: u32 = (1 << 4)
        | (3 << 9)
        | (3 << 28)
        | super::inte::INTERRUPTS_SUPPORTED;
    /// TPM1.2: interface version (TIS1.3) = 2, same data-transfer/burst/irq
    /// shape.
    pub const SUPPORTED_1_2: u32 = (1 << 4) | (3 << 9) | (2 << 28) | super::inte::INTERRUPTS_SUPPORTED;
}

pub const NO_DATA_BYTE: u8 = 0xff;
pub const TPM_DID: u32 = 0x0001;
pub const TPM_VID: u32 = 0x1014;
pub const TPM_RID: u32 = 0x01;
