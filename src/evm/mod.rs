//! # EVM Implementation
//!
//! Ethereum Virtual Machine implementation for smart contract execution.
//!
//! This is the outer layer of the hexagonal architecture: it implements
//! the domain ports ([`crate::ports::outbound`]) to provide actual EVM
//! execution.
//!
//! ## Components
//!
//! - `interpreter.rs` - Opcode execution engine
//! - `gas.rs` - Gas metering and costs
//! - `memory.rs` - Memory management
//! - `stack.rs` - Stack operations
//! - `opcodes.rs` - Opcode definitions
//! - `transient.rs` - Transient storage (EIP-1153)
//!
//! Calls into precompiled-contract addresses (0x01-0x09) are a host
//! concern: `StateAccess::get_code` for those addresses is expected to
//! return whatever the host wants CALL to execute, the interpreter itself
//! has no built-in precompile dispatch.

pub mod gas;
pub mod interpreter;
pub mod memory;
pub mod opcodes;
pub mod stack;
pub mod transient;

pub use gas::*;
pub use interpreter::*;
pub use memory::*;
pub use opcodes::*;
pub use stack::*;
pub use transient::*;
