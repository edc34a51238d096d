//! # evmcore
//!
//! A deterministic, gas-metered, stack-based EVM bytecode interpreter.
//!
//! ## Purpose
//!
//! Executes EVM bytecode against a host-provided world state: gas metering,
//! memory expansion, the full opcode set (including CREATE/CREATE2, the CALL
//! family, and SELFDESTRUCT), and hard-fork-configurable behavior. The crate
//! does not own persistent state or block construction; hosts implement the
//! [`ports::outbound::StateAccess`] port and apply the [`domain::entities::StateChange`]
//! journal an [`domain::entities::ExecutionResult`] returns.
//!
//! ## Architecture
//!
//! This crate is organized as a hexagonal (ports-and-adapters) architecture:
//!
//! - `domain/` - Pure types and logic with no I/O: entities, value objects,
//!   invariants, and address/gas-estimation services.
//! - `ports/` - Trait boundaries. `inbound.rs` is the API a host calls into
//!   ([`ports::inbound::SmartContractApi`]); `outbound.rs` is the SPI the
//!   host implements ([`ports::outbound::StateAccess`] and friends).
//! - `adapters/` - Reference implementations of the outbound ports
//!   (in-memory state and access-list tracking), useful for embedding and
//!   tests.
//! - `evm/` - The interpreter itself: stack, memory, gas tables, transient
//!   storage, and the opcode dispatch loop.
//! - `service.rs` - Orchestrates the interpreter for a host: builds the
//!   per-call execution context, pre-warms the access list, and tracks
//!   aggregate statistics.
//!
//! ## Hard forks
//!
//! Opcode and gas behavior is selected by [`domain::entities::VmConfig`],
//! which ships preset constructors (`frontier`, `homestead`, `byzantium`,
//! `berlin`, `london`, `shanghai`) forming an inheritance chain; `shanghai`
//! is the default.
//!
//! ## Execution limits
//!
//! | Limit | Value | Purpose |
//! |-------|-------|---------|
//! | `max_call_depth` | 1024 | Bound CALL/CREATE recursion |
//! | `max_code_size` | 24 KB (EIP-170) | Limit deployed contract size |
//! | `max_init_code_size` | 48 KB (EIP-3860) | Limit CREATE init code size |
//! | `max_stack_size` | 1024 | EVM stack limit |
//! | `max_memory_size` | 32 MB | Memory expansion limit |
//! | `execution_timeout_ms` | 5000 | Host-enforced wall-clock timeout |
//!
//! ## Outbound ports a host implements
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`ports::outbound::StateAccess`] | Read accounts, storage, and code; also the source of `BLOCKHASH`, `EXTCODEHASH`, and EIP-161 "is dead" checks |
//! | [`ports::outbound::SignatureVerifier`] | `ecrecover`, for a host's own ecrecover-precompile adapter |
//! | [`ports::outbound::AccessList`] | EIP-2929 warm/cold tracking |
//!
//! Calls into precompiled-contract addresses (0x01-0x09) are a host concern:
//! `StateAccess::get_code` for those addresses is expected to return
//! whatever the host wants CALL to execute. The interpreter itself has no
//! built-in precompile dispatch.
//!
//! ## Usage
//!
//! ```ignore
//! use evmcore::prelude::*;
//!
//! let result = api.execute_transaction(&tx, &block_context).await?;
//!
//! if result.success {
//!     println!("gas used: {}", result.gas_used);
//!     println!("output: {:?}", result.output);
//! }
//! ```

// Crate-level lints
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]

// =============================================================================
// MODULES
// =============================================================================

pub mod adapters;
pub mod domain;
pub mod errors;
pub mod evm;
pub mod ports;
pub mod service;

// =============================================================================
// PRELUDE
// =============================================================================

/// Convenient re-exports for common usage.
pub mod prelude {
    // Domain entities
    pub use crate::domain::entities::{
        AccountState, BlockContext, ExecutionContext, ExecutionResult, EvmVersion, InternalTx,
        InternalTxKind, Log, StateChange, VmConfig,
    };

    // Value objects
    pub use crate::domain::value_objects::{
        Address, Bytes, EcdsaSignature, GasCounter, Hash, StorageKey, StorageValue, U256,
    };

    // Domain services
    pub use crate::domain::services::{
        compute_contract_address, compute_contract_address_create2, estimate_base_gas, keccak256,
        precompiles,
    };

    // Invariants
    pub use crate::domain::invariants::{
        check_all_invariants, limits, InvariantCheckResult, InvariantViolation,
    };

    // Ports
    pub use crate::ports::inbound::{
        BatchExecutor, SignedTransaction, SmartContractApi, TransactionReceipt,
    };
    pub use crate::ports::outbound::{
        AccessList, AccessStatus, BlockHashOracle, SignatureVerifier, StateAccess,
    };

    // Errors
    pub use crate::errors::{StateError, VmError};

    // EVM components
    pub use crate::evm::{
        gas, memory::Memory, opcodes::Opcode, stack::Stack, transient::TransientStorage,
        Interpreter,
    };

    // Adapters
    pub use crate::adapters::{InMemoryAccessList, InMemoryState};

    // Service
    pub use crate::service::{
        create_test_service, ServiceConfig, ServiceStats, SmartContractService,
    };
}

// =============================================================================
// CRATE INFO
// =============================================================================

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// TESTS
// =============================================================================
