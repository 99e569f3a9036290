/// Errors that can occur while constructing a [`crate::TpmTis`].
///
/// Guest-visible protocol misuse (writes from a non-active locality, writes
/// in the wrong FSM state, short or oversized packets) is never reported
/// through this type -- per the TIS error model the state machine absorbs
/// those silently and stays self-consistent. This enum only covers the
/// construction-time failures a host integrator needs to surface.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No backend was supplied at construction time.
    #[error("tpm-tis: no backend configured")]
    NoBackend,
    /// The platform only routes IRQ lines 0-15 to this kind of device.
    #[error("tpm-tis: irq {0} is out of range (must be <= 15)")]
    IrqOutOfRange(u8),
}

pub type Result<T> = std::result::Result<T, Error>;
