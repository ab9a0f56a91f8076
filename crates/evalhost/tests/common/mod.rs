//! Shared setup for the integration tests: they all drive the bundled stub
//! interpreter binary through the real spawn path.

#![allow(dead_code)]

use std::time::Duration;

use evalhost::{HostConfig, HostLimits, ProcessConfig};

pub fn stub_command() -> &'static str {
    env!("CARGO_BIN_EXE_evalhost-stub")
}

pub fn stub_process() -> ProcessConfig {
    ProcessConfig::new(stub_command())
}

/// Stub config with test-friendly limits. The stub boots in milliseconds,
/// so a short handshake window keeps failure cases fast.
pub fn stub_config() -> HostConfig {
    let mut limits = HostLimits::default();
    limits.initialization_timeout = Duration::from_secs(5);
    limits.termination_grace = Duration::from_secs(1);
    HostConfig::new(stub_process()).with_limits(limits)
}
