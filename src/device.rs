use std::cmp::min;
use std::sync::{Arc, Barrier};

use log::{debug, trace, warn};

use crate::backend::{BackendCmd, BackendResponse, TpmBackend, TpmVersion};
use crate::bus::{InterruptLine, MmioDevice};
use crate::error::{Error, Result};
use crate::locality::{Locality, TisState};
use crate::regs::{self, access, iface_id, inte, ints, intf_capability, sts};

/// Construction-time configuration for a [`TpmTis`].
pub struct TpmTisConfig {
    /// IRQ line this device raises on the platform's interrupt controller.
    /// Must be <= 15.
    pub irq_num: u8,
}

/// The TIS/PTP-FIFO TPM interface: a 5-locality, 20 KiB MMIO window brokering
/// command/response traffic between a guest and an out-of-process TPM
/// backend.
pub struct TpmTis {
    locs: Vec<Locality>,
    buffer: Vec<u8>,
    rw_offset: u16,
    active_locty: u8,
    next_locty: u8,
    aborting_locty: u8,
    cmd: Option<BackendCmd>,
    be_tpm_version: TpmVersion,
    irq_num: u32,
    irq: Box<dyn InterruptLine + Send>,
    backend: Box<dyn TpmBackend + Send>,
}

impl TpmTis {
    pub fn new(
        config: TpmTisConfig,
        backend: Option<Box<dyn TpmBackend + Send>>,
        irq: Box<dyn InterruptLine + Send>,
    ) -> Result<Self> {
        if config.irq_num > 15 {
            return Err(Error::IrqOutOfRange(config.irq_num));
        }
        let backend = backend.ok_or(Error::NoBackend)?;

        let mut locs = Vec::with_capacity(regs::NUM_LOCALITIES as usize);
        for _ in 0..regs::NUM_LOCALITIES {
            locs.push(Locality::reset(0, 0));
        }

        let mut dev = TpmTis {
            locs,
            buffer: Vec::new(),
            rw_offset: 0,
            active_locty: regs::NO_LOCALITY,
            next_locty: regs::NO_LOCALITY,
            aborting_locty: regs::NO_LOCALITY,
            cmd: None,
            be_tpm_version: TpmVersion::Unspecified,
            irq_num: config.irq_num as u32,
            irq,
            backend,
        };
        dev.reset();
        Ok(dev)
    }

    /// Reset the device and its backend to their post-power-on defaults.
    pub fn reset(&mut self) {
        self.backend.reset();
        let buffer_size = min(self.backend.buffer_size(), regs::BUFFER_MAX);
        self.backend.startup(buffer_size);

        self.buffer = vec![0u8; buffer_size];
        self.rw_offset = 0;
        self.active_locty = regs::NO_LOCALITY;
        self.next_locty = regs::NO_LOCALITY;
        self.aborting_locty = regs::NO_LOCALITY;
        self.cmd = None;
        self.be_tpm_version = self.backend.version();

        let (sts_default, iface_default) = match self.be_tpm_version {
            TpmVersion::V2_0 => (sts::FAMILY_2_0, iface_id::SUPPORTED_FLAGS_2_0),
            _ => (sts::FAMILY_1_2, iface_id::SUPPORTED_FLAGS_1_2),
        };
        for loc in self.locs.iter_mut() {
            *loc = Locality::reset(sts_default, iface_default);
        }
    }

    /// Invoked by the host integrator's glue once a command submitted via
    /// [`TpmBackend::submit`] has produced a response.
    pub fn on_backend_completed(&mut self, response: BackendResponse) {
        let cmd = match self.cmd.take() {
            Some(cmd) => cmd,
            None => {
                warn!("tpm_tis: completion with no in-flight command, ignoring");
                return;
            }
        };
        let locty = cmd.locty;

        if response.selftest_done {
            for loc in self.locs.iter_mut() {
                loc.sts |= sts::SELFTEST_DONE;
            }
        }

        let n = min(response.output.len(), self.buffer.len());
        self.buffer[..n].copy_from_slice(&response.output[..n]);

        self.locs[locty as usize].sts_set(sts::VALID | sts::DATA_AVAILABLE);
        self.locs[locty as usize].state = TisState::Completion;
        self.rw_offset = 0;

        if self.next_locty != regs::NO_LOCALITY {
            self.abort();
        }

        self.raise_irq(locty, ints::DATA_AVAILABLE | ints::STS_VALID);
    }

    // ---- internal helpers ----

    fn cmd_size(&self) -> u32 {
        if self.buffer.len() < 6 {
            return 0;
        }
        u32::from_be_bytes([self.buffer[2], self.buffer[3], self.buffer[4], self.buffer[5]])
    }

    fn any_other_request_use(&self, locty: u8) -> bool {
        self.locs
            .iter()
            .enumerate()
            .any(|(i, l)| i as u8 != locty && l.access & access::REQUEST_USE != 0)
    }

    fn raise_irq(&mut self, locty: u8, mask: u32) {
        if locty >= regs::NUM_LOCALITIES {
            return;
        }
        let loc = &mut self.locs[locty as usize];
        if (loc.inte & inte::INT_ENABLED != 0) && (loc.inte & mask != 0) {
            loc.ints |= mask;
            if let Err(e) = self.irq.trigger(0) {
                warn!("tpm_tis: failed to trigger irq {}: {}", self.irq_num, e);
            }
        }
    }

    fn new_active_locality(&mut self, new_locty: u8) {
        let change = self.active_locty != new_locty;

        if change && self.active_locty != regs::NO_LOCALITY {
            let is_seize =
                new_locty != regs::NO_LOCALITY && (self.locs[new_locty as usize].access & access::SEIZE != 0);
            let old = self.active_locty as usize;
            if is_seize {
                self.locs[old].access &= !access::ACTIVE_LOCALITY;
                self.locs[old].access |= access::BEEN_SEIZED;
            } else {
                self.locs[old].access &= !(access::ACTIVE_LOCALITY | access::REQUEST_USE);
            }
        }

        self.active_locty = new_locty;

        if new_locty != regs::NO_LOCALITY {
            let n = new_locty as usize;
            self.locs[n].access |= access::ACTIVE_LOCALITY;
            self.locs[n].access &= !(access::REQUEST_USE | access::SEIZE);
        }

        if change {
            trace!("tpm_tis: active locality -> {}", new_locty);
            self.raise_irq(self.active_locty, ints::LOCALITY_CHANGED);
        }
    }

    /// Prepare to abort whatever the current active locality is doing and
    /// hand off to `new_locty`. Defers to the backend completion callback
    /// if a command is currently executing.
    fn prep_abort(&mut self, locty: u8, new_locty: u8) {
        self.aborting_locty = locty;
        self.next_locty = new_locty;

        let executing = self.locs.iter().any(|l| l.state == TisState::Execution);
        if executing {
            debug!("tpm_tis: deferring abort, command in flight");
            self.backend.cancel();
            return;
        }

        self.abort();
    }

    fn abort(&mut self) {
        self.rw_offset = 0;

        if self.aborting_locty == self.next_locty && self.aborting_locty != regs::NO_LOCALITY {
            let l = self.aborting_locty as usize;
            self.locs[l].state = TisState::Ready;
            self.locs[l].sts_set(sts::COMMAND_READY);
            self.raise_irq(self.aborting_locty, ints::COMMAND_READY);
        }

        self.new_active_locality(self.next_locty);

        self.aborting_locty = regs::NO_LOCALITY;
        self.next_locty = regs::NO_LOCALITY;
    }

    fn tpm_send(&mut self, locty: u8) {
        self.locs[locty as usize].state = TisState::Execution;
        let cmd = BackendCmd {
            locty,
            input: self.buffer[..self.rw_offset as usize].to_vec(),
            input_len: self.rw_offset as u32,
            output_cap: self.buffer.len(),
        };
        self.cmd = Some(cmd.clone());
        self.backend.submit(cmd);
    }

    /// Append one byte received over the FIFO while in RECEPTION.
    fn fifo_append_byte(&mut self, locty: u8, byte: u8) {
        if self.locs[locty as usize].sts & sts::EXPECT == 0 {
            return;
        }

        if (self.rw_offset as usize) < self.buffer.len() {
            self.buffer[self.rw_offset as usize] = byte;
            self.rw_offset += 1;
        } else {
            self.locs[locty as usize].sts_set(sts::VALID);
            return;
        }

        if self.rw_offset > 5 && (self.locs[locty as usize].sts & sts::EXPECT != 0) {
            let need_irq = self.locs[locty as usize].sts & sts::VALID == 0;
            let len = self.cmd_size();
            if len > self.rw_offset as u32 {
                self.locs[locty as usize].sts_set(sts::EXPECT | sts::VALID);
            } else {
                self.locs[locty as usize].sts_set(sts::VALID);
            }
            if need_irq {
                self.raise_irq(locty, ints::STS_VALID);
            }
        }
    }

    /// Read one byte of response data while in COMPLETION.
    fn fifo_read_byte(&mut self, locty: u8) -> u8 {
        if self.active_locty != locty || self.locs[locty as usize].state != TisState::Completion {
            return regs::NO_DATA_BYTE;
        }
        if self.rw_offset as usize >= self.buffer.len() {
            return regs::NO_DATA_BYTE;
        }

        let len = min(self.cmd_size(), self.buffer.len() as u32);
        let byte = self.buffer[self.rw_offset as usize];
        self.rw_offset += 1;

        if self.rw_offset as u32 >= len {
            self.locs[locty as usize].sts |= sts::VALID;
            self.raise_irq(locty, ints::STS_VALID);
        }

        byte
    }

    fn read_access(&mut self, locty: u8) -> u32 {
        let mut val = (self.locs[locty as usize].access & !access::SEIZE) as u32;
        if self.any_other_request_use(locty) {
            val |= access::PENDING_REQUEST as u32;
        }
        if !self.backend.established_flag() {
            val |= access::TPM_ESTABLISHMENT as u32;
        }
        val |= access::TPM_REG_VALID_STS as u32;
        val
    }

    fn read_sts(&mut self, locty: u8, access_size: usize) -> u32 {
        if locty != self.active_locty {
            return 0;
        }
        let sts_val = self.locs[locty as usize].sts;
        let avail = if sts_val & sts::DATA_AVAILABLE != 0 {
            min(self.cmd_size(), self.buffer.len() as u32).saturating_sub(self.rw_offset as u32)
        } else {
            let mut avail = self.buffer.len() as u32 - self.rw_offset as u32;
            if access_size == 1 && avail > 0xff {
                avail = 0xff;
            }
            avail
        };
        (avail << sts::BURST_COUNT_SHIFT) | sts_val
    }

    fn intf_capability(&self) -> u32 {
        match self.be_tpm_version {
            TpmVersion::V2_0 => intf_capability::SUPPORTED_2_0,
            _ => intf_capability::SUPPORTED_1_2,
        }
    }

    /// Full 32-bit register contents for every non-FIFO register. `0xffff_ffff`
    /// for anything unlisted.
    fn register_value(&mut self, locty: u8, reg_offset: u64, access_size: usize) -> u32 {
        match reg_offset {
            regs::REG_ACCESS => self.read_access(locty),
            regs::REG_INT_ENABLE => self.locs[locty as usize].inte,
            regs::REG_INT_VECTOR => self.irq_num,
            regs::REG_INT_STATUS => self.locs[locty as usize].ints,
            regs::REG_INTF_CAPABILITY => self.intf_capability(),
            regs::REG_STS => self.read_sts(locty, access_size),
            regs::REG_INTERFACE_ID => self.locs[locty as usize].iface_id,
            regs::REG_DID_VID => (regs::TPM_DID << 16) | regs::TPM_VID,
            regs::REG_RID => regs::TPM_RID,
            _ => 0xffff_ffff,
        }
    }

    fn is_fifo_offset(reg_offset: u64) -> bool {
        reg_offset == regs::REG_DATA_FIFO
            || (regs::REG_DATA_XFIFO..=regs::REG_DATA_XFIFO_END).contains(&reg_offset)
    }

    fn write_access(&mut self, locty: u8, mut val: u8) {
        let mut candidate = self.active_locty;
        let mut deferred = false;

        if val & access::SEIZE != 0 && val & access::ACTIVE_LOCALITY != 0 {
            val &= !(access::ACTIVE_LOCALITY | access::REQUEST_USE);
        }

        if val & access::ACTIVE_LOCALITY != 0 {
            if locty == self.active_locty {
                let mut new_owner = regs::NO_LOCALITY;
                for c in (0..regs::NUM_LOCALITIES).rev() {
                    if self.locs[c as usize].access & access::REQUEST_USE != 0 {
                        new_owner = c;
                        break;
                    }
                }
                if new_owner != regs::NO_LOCALITY {
                    self.prep_abort(self.active_locty, new_owner);
                    deferred = true;
                } else {
                    candidate = regs::NO_LOCALITY;
                }
            } else {
                self.locs[locty as usize].access &= !access::REQUEST_USE;
            }
        }

        if val & access::BEEN_SEIZED != 0 {
            self.locs[locty as usize].access &= !access::BEEN_SEIZED;
        }

        if !deferred && val & access::SEIZE != 0 {
            let allowed = self.active_locty == regs::NO_LOCALITY || locty > self.active_locty;
            if allowed {
                let higher_seize_pending =
                    ((locty + 1)..regs::NUM_LOCALITIES).any(|l| self.locs[l as usize].access & access::SEIZE != 0);
                if !higher_seize_pending {
                    for l in 0..locty {
                        self.locs[l as usize].access &= !access::SEIZE;
                    }
                    self.locs[locty as usize].access |= access::SEIZE;
                    self.prep_abort(self.active_locty, locty);
                    deferred = true;
                }
            }
        }

        if !deferred && val & access::REQUEST_USE != 0 {
            if self.active_locty == regs::NO_LOCALITY {
                candidate = locty;
            } else if self.active_locty != locty {
                self.locs[locty as usize].access |= access::REQUEST_USE;
            }
        }

        if !deferred {
            self.new_active_locality(candidate);
        }
    }

    fn write_int_enable(&mut self, locty: u8, val: u32, access_mask: u32) {
        if locty != self.active_locty {
            return;
        }
        let allowed = inte::INT_ENABLED | inte::POLARITY_MASK | inte::INTERRUPTS_SUPPORTED;
        let mask = allowed & access_mask;
        let loc = &mut self.locs[locty as usize];
        loc.inte = (loc.inte & !mask) | (val & mask);
    }

    fn write_int_status(&mut self, locty: u8, val: u32) {
        if locty != self.active_locty {
            return;
        }
        let clearable = val & inte::INTERRUPTS_SUPPORTED;
        let loc = &mut self.locs[locty as usize];
        loc.ints &= !clearable;
        if loc.ints == 0 {
            if let Err(e) = self.irq.deassert(0) {
                warn!("tpm_tis: failed to deassert irq {}: {}", self.irq_num, e);
            }
        }
    }

    fn write_sts(&mut self, locty: u8, val: u32) {
        if locty != self.active_locty {
            return;
        }

        if self.be_tpm_version == TpmVersion::V2_0 {
            if val & sts::COMMAND_CANCEL != 0 && self.locs[locty as usize].state == TisState::Execution {
                self.backend.cancel();
            }
            if val & sts::RESET_ESTABLISHMENT_BIT != 0 && (locty == 3 || locty == 4) {
                self.backend.reset_established_flag(locty);
            }
        }

        match val & sts::WRITABLE_COMMAND_MASK {
            sts::COMMAND_READY => self.write_sts_command_ready(locty),
            sts::TPM_GO => self.write_sts_tpm_go(locty),
            sts::RESPONSE_RETRY => self.write_sts_response_retry(locty),
            _ => {}
        }
    }

    fn write_sts_command_ready(&mut self, locty: u8) {
        match self.locs[locty as usize].state {
            TisState::Ready => {
                self.rw_offset = 0;
            }
            TisState::Idle => {
                self.locs[locty as usize].sts_set(sts::COMMAND_READY);
                self.locs[locty as usize].state = TisState::Ready;
                self.raise_irq(locty, ints::COMMAND_READY);
            }
            TisState::Reception | TisState::Execution => {
                self.prep_abort(locty, locty);
            }
            TisState::Completion => {
                self.rw_offset = 0;
                self.locs[locty as usize].state = TisState::Ready;
                if self.locs[locty as usize].sts & sts::COMMAND_READY == 0 {
                    self.locs[locty as usize].sts_set(sts::COMMAND_READY);
                    self.raise_irq(locty, ints::COMMAND_READY);
                }
                self.locs[locty as usize].sts &= !sts::DATA_AVAILABLE;
            }
        }
    }

    fn write_sts_tpm_go(&mut self, locty: u8) {
        if self.locs[locty as usize].state == TisState::Reception
            && self.locs[locty as usize].sts & sts::EXPECT == 0
        {
            self.tpm_send(locty);
        }
    }

    fn write_sts_response_retry(&mut self, locty: u8) {
        if self.locs[locty as usize].state == TisState::Completion {
            self.rw_offset = 0;
            self.locs[locty as usize].sts_set(sts::VALID | sts::DATA_AVAILABLE);
        }
    }

    fn write_interface_id(&mut self, val: u32) {
        if val & iface_id::INT_SEL_LOCK != 0 {
            for loc in self.locs.iter_mut() {
                loc.iface_id |= iface_id::INT_SEL_LOCK;
            }
        }
    }

    fn fifo_write(&mut self, locty: u8, data: &[u8], addr: u64) {
        if locty != self.active_locty {
            return;
        }
        let effective_size = min(data.len(), 4 - (addr & 0x3) as usize);
        for &byte in &data[..effective_size] {
            match self.locs[locty as usize].state {
                TisState::Idle | TisState::Execution | TisState::Completion => {}
                TisState::Ready => {
                    self.locs[locty as usize].state = TisState::Reception;
                    self.locs[locty as usize].sts_set(sts::EXPECT | sts::VALID);
                    self.fifo_append_byte(locty, byte);
                }
                TisState::Reception => {
                    self.fifo_append_byte(locty, byte);
                }
            }
        }
    }

    fn fifo_read(&mut self, locty: u8, data: &mut [u8], addr: u64) {
        let effective_size = min(data.len(), 4 - (addr & 0x3) as usize);
        for slot in data[..effective_size].iter_mut() {
            *slot = self.fifo_read_byte(locty);
        }
    }
}

/// Bits [1:0] of the address, as a byte-lane mask over a 32-bit register.
fn access_mask(shift: u64, size: usize) -> u32 {
    let size_mask: u32 = if size >= 4 {
        0xffff_ffff
    } else {
        (1u32 << (size * 8)) - 1
    };
    size_mask << (shift * 8)
}

impl MmioDevice for TpmTis {
    fn read(&mut self, base: u64, offset: u64, data: &mut [u8]) {
        let addr = base + offset;
        let locty = ((addr >> regs::LOCALITY_SHIFT) & 0x7) as u8;
        let reg_offset = (addr & 0xfff) & !0x3;
        let shift = addr & 0x3;

        if self.backend.had_startup_error() {
            for b in data.iter_mut() {
                *b = 0;
            }
            return;
        }

        if locty >= regs::NUM_LOCALITIES {
            for b in data.iter_mut() {
                *b = 0xff;
            }
            return;
        }

        if Self::is_fifo_offset(reg_offset) {
            self.fifo_read(locty, data, addr);
            return;
        }

        let full = self.register_value(locty, reg_offset, data.len());
        let shifted = full >> (shift * 8);
        for (i, slot) in data.iter_mut().enumerate() {
            *slot = (shifted >> (i * 8)) as u8;
        }
    }

    fn write(&mut self, base: u64, offset: u64, data: &[u8]) -> Option<Arc<Barrier>> {
        let addr = base + offset;
        let locty = ((addr >> regs::LOCALITY_SHIFT) & 0x7) as u8;
        let reg_offset = (addr & 0xfff) & !0x3;
        let shift = addr & 0x3;

        if data.len() > 4 {
            warn!("tpm_tis: write of {} bytes rejected", data.len());
            return None;
        }

        if self.backend.had_startup_error() {
            return None;
        }

        if locty == 4 || locty >= regs::NUM_LOCALITIES {
            return None;
        }

        if Self::is_fifo_offset(reg_offset) {
            self.fifo_write(locty, data, addr);
            return None;
        }

        let mut wval: u32 = 0;
        for (i, &b) in data.iter().enumerate() {
            wval |= (b as u32) << ((shift as usize + i) * 8);
        }
        let amask = access_mask(shift, data.len());

        match reg_offset {
            regs::REG_ACCESS => self.write_access(locty, (wval & 0xff) as u8),
            regs::REG_INT_ENABLE => self.write_int_enable(locty, wval, amask),
            regs::REG_INT_VECTOR => {}
            regs::REG_INT_STATUS => self.write_int_status(locty, wval),
            regs::REG_STS => self.write_sts(locty, wval),
            regs::REG_INTERFACE_ID => self.write_interface_id(wval),
            _ => {
                trace!("tpm_tis: write to unhandled offset {:#x}", reg_offset);
            }
        }

        None
    }
}
