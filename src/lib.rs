//! Ephemeral SSH access for CI jobs.
//!
//! One invocation brings up an SSH daemon on the runner (a private user-mode
//! instance, the reconfigured system daemon, or the Windows OpenSSH service),
//! installs the supplied public keys, and then exposes the daemon through one
//! or more relay tunnels started concurrently. Each tunnel reports its own
//! endpoint and connect command; a failing tunnel never affects the others.
//!
//! The flow is:
//!
//! 1. [`config::Settings`] resolves everything from the environment.
//! 2. [`sshd::SshBringup`] drives the daemon to a listening state.
//! 3. [`tunnel::TunnelOrchestrator`] runs every enabled [`tunnel::TunnelPlugin`].
//! 4. [`report::RunReport`] logs the result and exports pipeline variables.

pub mod backoff;
pub mod config;
pub mod error;
pub mod install;
pub mod probe;
pub mod process;
pub mod report;
pub mod sshd;
pub mod tunnel;
pub mod types;

pub use error::{RelayError, Result};
