//! Instruction-set primitives for the Plume virtual machine.
//!
//! This crate holds everything the module loader and the interpreter share
//! but that does not depend on the runtime: the opcode table of the BEAM
//! compact-instruction dialect, the compact operand encoding (decoder and
//! encoder), the `FOR1`/`BEAM` chunk container, and the AVM pack archive
//! framing.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

pub mod beam;
pub mod compact;
pub mod encode;
pub mod opcode;
pub mod pack;

pub use beam::{BeamChunks, BeamError, CodeHeader};
pub use compact::{AllocList, Operand, OperandError};
pub use opcode::Opcode;
pub use pack::{PackError, PackRecord};
