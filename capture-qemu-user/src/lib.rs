//! QEMU user-mode plugin recording which instructions of one binary were executed.
//!
//! Loaded with `-plugin libcapture_qemu_user.so,binary=<path>[,output=<path>][,legacy=<path>]`.

mod capture;
mod log;
mod plugin;
pub mod qemu;
