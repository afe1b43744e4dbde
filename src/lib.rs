//! vboxctl: run one lightweight VM under VirtualBox and attach its serial
//! console to the terminal.
//!
//! The launch path lives in [`vm`]; [`config`], [`paths`] and [`logging`]
//! carry the host-side plumbing the binary needs.

pub mod config;
pub mod logging;
pub mod paths;
pub mod vm;
