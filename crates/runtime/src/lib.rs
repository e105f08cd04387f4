//! Runtime library for Poke
//!
//! Two subsystems live here:
//!
//! - [`ios`]: IO spaces over byte-addressable devices (files,
//!   memory, streams, process memory, network block devices,
//!   sub-range windows), with bit-level integer and string IO.
//! - [`vm`]: the Poke virtual machine executing PVM programs
//!   produced by the compiler.
//!
//! The value model the VM manipulates is defined in `poke-core`,
//! shared with the compiler.

pub mod ios;
pub mod vm;

pub use ios::{Endian, IosError, IosStack, Nenc};
pub use vm::{ExitCode, Omode, Vm};
