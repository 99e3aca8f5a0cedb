//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! Per-context renderer engine for a host-side virtual GPU backend.
//!
//! A privileged guest speaks a command-stream protocol over shared-memory
//! rings; this crate owns everything on the host side of a single context:
//! the resource and object tables, the command decoder/dispatch loop, ring
//! liveness monitoring and seqno waits, the device-memory export policy,
//! and the fence/timeline retirement pipeline. The host graphics driver,
//! the transport that hands us command buffers, and the individual wire
//! opcodes are all external collaborators — see [`driver::HostDriver`].

pub mod codec;
pub mod context;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod fence;
pub mod memory;
pub mod monitor;
pub mod object;
pub mod resource;
pub mod ring;

pub use context::{Context, ContextConfig};
pub use error::{Error, ErrorKind, Result};

/// Test-only logging setup, so the unit test suite scattered across every
/// module's `#[cfg(test)] mod tests` runs with diagnostics visible (`cargo
/// test -- --nocapture`) instead of silently. Wired in from
/// [`driver::test_support::FakeDriver::new`] rather than per-test, so every
/// test gets it for free without boilerplate.
#[cfg(test)]
pub(crate) mod test_logging {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = env_logger::builder().is_test(true).try_init();
        });
    }
}
