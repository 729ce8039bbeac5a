//! Architecture-specific code for vireo
//!
//! Everything the machine-independent core needs from the hardware goes
//! through this module: interrupt flag control, CPU identity, address-space
//! activation, TLB invalidation, and a call-stack capture used by the lock
//! debugging aids.
//!
//! Each primitive has two renditions selected by `target_os`: the real
//! instruction sequence on bare metal, and a software shim on hosted targets
//! so the core's state machines run under the ordinary test harness. The
//! hosted shims are target-independent, which lets the test suite run on any
//! development host.

pub mod x86_64;

pub use x86_64::*;
