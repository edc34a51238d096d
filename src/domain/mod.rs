//! # Domain Layer
//!
//! Pure business logic for EVM execution: entities, value objects,
//! invariants, and address/gas-estimation services.
//! NO I/O, NO async, NO external dependencies.
//!
//! This is the inner layer of the hexagonal architecture: dependencies
//! point inward only (ports and adapters depend on this, not vice versa).

pub mod entities;
pub mod invariants;
pub mod services;
pub mod value_objects;

pub use entities::*;
pub use invariants::*;
pub use services::*;
pub use value_objects::*;
