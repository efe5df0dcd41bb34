//! SSHKit Core, the SSH2 client engine behind SSHKit
//!
//! Connects to an SSH server, verifies the host key fingerprint,
//! authenticates with a password and runs SFTP directory operations
//! and remote commands, through a C FFI interface consumed by Swift.

pub mod ffi;
pub mod ssh;
