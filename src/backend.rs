//! The contract this crate needs from an out-of-process TPM implementation.
//!
//! The backend itself -- the wire protocol that actually talks to a TPM
//! simulator or a passthrough device -- lives elsewhere; this module only
//! pins down the shape a host integrator's adapter must have.

/// TPM family the backend speaks. Affects several register defaults and
/// which STS bits are meaningful.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TpmVersion {
    Unspecified,
    V1_2,
    V2_0,
}

/// A single in-flight command handed to the backend. At most one of these
/// is outstanding at a time.
#[derive(Debug, Clone)]
pub struct BackendCmd {
    pub locty: u8,
    pub input: Vec<u8>,
    pub input_len: u32,
    pub output_cap: usize,
}

/// Outcome of a completed backend command, delivered through
/// [`crate::TpmTis::on_backend_completed`].
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub output: Vec<u8>,
    pub selftest_done: bool,
}

/// The asynchronous TPM service this device brokers commands to.
///
/// `submit` must not block: it hands the command off and returns
/// immediately. The result comes back later via
/// [`crate::TpmTis::on_backend_completed`], invoked by whatever glue code
/// owns both the backend and the device.
pub trait TpmBackend {
    /// TPM family implemented by the backend.
    fn version(&self) -> TpmVersion;

    /// Buffer size the backend is willing to use. The core clamps this to
    /// 4096 bytes.
    fn buffer_size(&mut self) -> usize;

    /// Reset the backend's internal state.
    fn reset(&mut self);

    /// Start (or restart) the backend with the given negotiated buffer size.
    fn startup(&mut self, buffer_size: usize);

    /// Submit a command. Must not block.
    fn submit(&mut self, cmd: BackendCmd);

    /// Request cancellation of the in-flight command. May be a no-op if the
    /// backend doesn't support it; success is only observable when the
    /// completion eventually arrives.
    fn cancel(&mut self);

    /// Query the TPM-established flag.
    fn established_flag(&mut self) -> bool;

    /// Clear the established flag. Only ever invoked for localities 3 and 4.
    fn reset_established_flag(&mut self, locty: u8);

    /// Whether the backend failed to come up. While true, the dispatcher
    /// returns 0 for all reads and drops all writes.
    fn had_startup_error(&self) -> bool;
}

#[cfg(test)]
pub mod mock {
    //! A synchronous, in-process mock backend for unit tests. Submitted
    //! commands complete immediately; the caller decides when to deliver
    //! the queued response by calling `take_response`.

    use super::{BackendCmd, BackendResponse, TpmBackend, TpmVersion};
    use std::sync::{Arc, Mutex};

    pub struct MockBackend {
        pub version: TpmVersion,
        pub buffer_size: usize,
        startup_error: Arc<Mutex<bool>>,
        pub established: bool,
        pub reset_established_calls: Vec<u8>,
        pub cancel_calls: u32,
        pub submitted: Vec<BackendCmd>,
        pub next_response: Option<BackendResponse>,
    }

    impl MockBackend {
        pub fn new(version: TpmVersion, buffer_size: usize) -> Self {
            MockBackend {
                version,
                buffer_size,
                startup_error: Arc::new(Mutex::new(false)),
                established: true,
                reset_established_calls: Vec::new(),
                cancel_calls: 0,
                submitted: Vec::new(),
                next_response: None,
            }
        }

        /// Queue the response that the *next* `submit` will "produce" --
        /// tests call `TpmTis::on_backend_completed` with this value
        /// themselves to simulate the asynchronous completion edge.
        pub fn queue_response(&mut self, output: Vec<u8>, selftest_done: bool) {
            self.next_response = Some(BackendResponse {
                output,
                selftest_done,
            });
        }

        /// A cloneable handle to the startup-error flag. Lets a test flip the
        /// flag after the backend has already been boxed into a `TpmTis`,
        /// without reaching back through the trait object.
        pub fn startup_error_handle(&self) -> Arc<Mutex<bool>> {
            self.startup_error.clone()
        }
    }

    impl TpmBackend for MockBackend {
        fn version(&self) -> TpmVersion {
            self.version
        }

        fn buffer_size(&mut self) -> usize {
            self.buffer_size
        }

        fn reset(&mut self) {}

        fn startup(&mut self, _buffer_size: usize) {}

        fn submit(&mut self, cmd: BackendCmd) {
            self.submitted.push(cmd);
        }

        fn cancel(&mut self) {
            self.cancel_calls += 1;
        }

        fn established_flag(&mut self) -> bool {
            self.established
        }

        fn reset_established_flag(&mut self, locty: u8) {
            self.established = false;
            self.reset_established_calls.push(locty);
        }

        fn had_startup_error(&self) -> bool {
            *self.startup_error.lock().unwrap()
        }
    }
}
