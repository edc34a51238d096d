//! # Ports Layer
//!
//! Trait definitions for EVM execution: the interfaces between the domain
//! and the outside world.
//!
//! - **Driving ports (inbound)**: [`inbound::SmartContractApi`], [`inbound::BatchExecutor`]
//! - **Driven ports (outbound)**: [`outbound::StateAccess`], [`outbound::SignatureVerifier`], [`outbound::AccessList`]
//! - No concrete implementations in this module; see [`crate::adapters`].

pub mod inbound;
pub mod outbound;

pub use inbound::*;
pub use outbound::*;
