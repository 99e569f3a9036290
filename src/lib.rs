//! Memory-mapped TIS/PTP-FIFO TPM interface emulator.
//!
//! [`TpmTis`] implements the 5-locality, 20 KiB MMIO register window a guest
//! uses to exchange TPM commands and responses with an out-of-process TPM
//! backend. The wire protocol to that backend is not this crate's concern;
//! callers provide one by implementing [`TpmBackend`].

mod backend;
mod bus;
mod device;
mod error;
mod locality;
mod regs;

pub use backend::{BackendCmd, BackendResponse, TpmBackend, TpmVersion};
pub use bus::{InterruptLine, MmioDevice};
pub use device::{TpmTis, TpmTisConfig};
pub use error::Error;
