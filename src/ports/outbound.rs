//! # Driven Ports (SPI - Outbound)
//!
//! Interfaces that the interpreter depends on but does not implement.
//! A host provides adapters for:
//! - State access (accounts, storage, code)
//! - Signature verification (for a host's own ecrecover adapter)
//! - Block hash lookups (BLOCKHASH)
//! - Warm/cold access-list tracking (EIP-2929)
//!
//! Dependencies point inward: adapters implement these traits, the
//! interpreter only calls them.

use crate::domain::entities::AccountState;
use crate::domain::value_objects::{
    Address, Bytes, EcdsaSignature, Hash, StorageKey, StorageValue, U256,
};
use crate::errors::StateError;
use async_trait::async_trait;

// =============================================================================
// STATE ACCESS
// =============================================================================

/// Interface for accessing blockchain state.
///
/// Reads flow straight through to the host; writes observed during
/// execution are NOT applied through this trait. Instead the interpreter
/// records them as [`crate::domain::entities::StateChange`] entries on the
/// returned [`crate::domain::entities::ExecutionResult`], and the host
/// applies them atomically after a successful call (discarding them on
/// revert).
#[async_trait]
pub trait StateAccess: Send + Sync {
    /// Get account state.
    ///
    /// # Arguments
    ///
    /// * `address` - Account address to query
    ///
    /// # Returns
    ///
    /// * `Some(AccountState)` - If account exists
    /// * `None` - If account does not exist (never interacted with)
    async fn get_account(&self, address: Address) -> Result<Option<AccountState>, StateError>;

    /// Get storage value.
    ///
    /// # Arguments
    ///
    /// * `address` - Contract address
    /// * `key` - Storage slot key
    ///
    /// # Returns
    ///
    /// * `StorageValue` - Value at slot (zero if never written)
    async fn get_storage(
        &self,
        address: Address,
        key: StorageKey,
    ) -> Result<StorageValue, StateError>;

    /// Set storage value.
    ///
    /// Note: This queues the write. Actual application happens on commit.
    ///
    /// # Arguments
    ///
    /// * `address` - Contract address
    /// * `key` - Storage slot key
    /// * `value` - New value to store
    async fn set_storage(
        &self,
        address: Address,
        key: StorageKey,
        value: StorageValue,
    ) -> Result<(), StateError>;

    /// Get contract code.
    ///
    /// # Arguments
    ///
    /// * `address` - Contract address
    ///
    /// # Returns
    ///
    /// * `Bytes` - Contract bytecode (empty for EOA)
    async fn get_code(&self, address: Address) -> Result<Bytes, StateError>;

    /// Check if account exists.
    ///
    /// An account exists if it has non-zero balance, non-zero nonce,
    /// or non-empty code.
    async fn account_exists(&self, address: Address) -> Result<bool, StateError>;

    /// Get account balance.
    ///
    /// Convenience method that extracts balance from account state.
    async fn get_balance(&self, address: Address) -> Result<U256, StateError> {
        match self.get_account(address).await? {
            Some(account) => Ok(account.balance),
            None => Ok(U256::zero()),
        }
    }

    /// Get account nonce.
    ///
    /// Convenience method that extracts nonce from account state.
    async fn get_nonce(&self, address: Address) -> Result<u64, StateError> {
        match self.get_account(address).await? {
            Some(account) => Ok(account.nonce),
            None => Ok(0),
        }
    }

    /// Get code hash for an address.
    ///
    /// Returns the keccak256 hash of the code, or the empty code hash for EOAs.
    async fn get_code_hash(&self, address: Address) -> Result<Hash, StateError> {
        match self.get_account(address).await? {
            Some(account) => Ok(account.code_hash),
            None => Ok(AccountState::EMPTY_CODE_HASH),
        }
    }

    /// Get code size.
    async fn get_code_size(&self, address: Address) -> Result<usize, StateError> {
        let code = self.get_code(address).await?;
        Ok(code.len())
    }

    /// Returns true if the account is "dead": it doesn't exist, or it has
    /// zero balance, zero nonce, and no code (EIP-161).
    ///
    /// Used by CALL/SELFDESTRUCT to decide whether transferring value to an
    /// address creates a new account and owes the associated gas surcharge.
    async fn is_account_dead(&self, address: Address) -> Result<bool, StateError> {
        match self.get_account(address).await? {
            None => Ok(true),
            Some(account) => Ok(account.is_empty()),
        }
    }

    /// Returns true if the account has non-zero nonce or non-empty code.
    ///
    /// EIP-684: contract creation at an address already occupied by a
    /// "live" account (as opposed to one that merely received a balance)
    /// is rejected.
    async fn non_empty_code_or_nonce(&self, address: Address) -> Result<bool, StateError> {
        match self.get_account(address).await? {
            None => Ok(false),
            Some(account) => Ok(account.nonce != 0 || account.code_hash != AccountState::EMPTY_CODE_HASH),
        }
    }

    /// Get the hash of a historical block, for the BLOCKHASH opcode.
    ///
    /// Default implementation has no chain history available and always
    /// returns `None`; hosts that track block history should override it.
    async fn get_block_hash(
        &self,
        _number: u64,
        _current_number: u64,
    ) -> Result<Option<Hash>, StateError> {
        Ok(None)
    }
}

// =============================================================================
// SIGNATURE VERIFIER
// =============================================================================

/// Interface for ECDSA signature verification.
///
/// Not called by the interpreter itself (precompile dispatch is a host
/// concern, see the crate-level docs); provided so a host can build its own
/// ecrecover-precompile adapter on top of it.
pub trait SignatureVerifier: Send + Sync {
    /// Recover signer address from an ECDSA signature.
    ///
    /// # Arguments
    ///
    /// * `hash` - 32-byte message hash
    /// * `signature` - ECDSA signature (r, s, v)
    ///
    /// # Returns
    ///
    /// * `Some(Address)` - Recovered signer address
    /// * `None` - If signature is invalid
    fn ecrecover(&self, hash: &Hash, signature: &EcdsaSignature) -> Option<Address>;
}

// =============================================================================
// BLOCK HASH ORACLE (For BLOCKHASH opcode)
// =============================================================================

/// Interface for querying historical block hashes.
///
/// Used by the BLOCKHASH opcode which can access the last 256 block hashes.
#[async_trait]
pub trait BlockHashOracle: Send + Sync {
    /// Get block hash for a given block number.
    ///
    /// # Arguments
    ///
    /// * `number` - Block number to query
    /// * `current_number` - Current block number (for range validation)
    ///
    /// # Returns
    ///
    /// * `Some(Hash)` - Block hash if within valid range (last 256 blocks)
    /// * `None` - If block is too old or doesn't exist
    async fn get_block_hash(&self, number: u64, current_number: u64) -> Option<Hash>;
}

// =============================================================================
// ACCESS LIST (EIP-2929/2930)
// =============================================================================

/// Access status for storage/accounts (EIP-2929).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessStatus {
    /// First access in this transaction (cold).
    Cold,
    /// Already accessed in this transaction (warm).
    Warm,
}

/// Interface for tracking warm/cold access status.
///
/// Per EIP-2929, first access to an account or storage slot costs more gas.
pub trait AccessList: Send + Sync {
    /// Check and mark account as accessed.
    ///
    /// Returns the previous access status.
    fn touch_account(&mut self, address: Address) -> AccessStatus;

    /// Check and mark storage slot as accessed.
    ///
    /// Returns the previous access status.
    fn touch_storage(&mut self, address: Address, key: StorageKey) -> AccessStatus;

    /// Check if account is warm.
    fn is_account_warm(&self, address: Address) -> bool;

    /// Check if storage slot is warm.
    fn is_storage_warm(&self, address: Address, key: StorageKey) -> bool;

    /// Pre-warm an account (make it warm without returning status).
    fn warm_account(&mut self, address: Address) {
        let _ = self.touch_account(address);
    }

    /// Pre-warm a storage slot (make it warm without returning status).
    fn warm_storage(&mut self, address: Address, key: StorageKey) {
        let _ = self.touch_storage(address, key);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_status() {
        assert_eq!(AccessStatus::Cold, AccessStatus::Cold);
        assert_ne!(AccessStatus::Cold, AccessStatus::Warm);
    }

    // Mock implementation for testing
    struct MockStateAccess;

    #[async_trait]
    impl StateAccess for MockStateAccess {
        async fn get_account(&self, _address: Address) -> Result<Option<AccountState>, StateError> {
            Ok(Some(AccountState::new_eoa(U256::from(1000), 5)))
        }

        async fn get_storage(
            &self,
            _address: Address,
            _key: StorageKey,
        ) -> Result<StorageValue, StateError> {
            Ok(StorageValue::ZERO)
        }

        async fn set_storage(
            &self,
            _address: Address,
            _key: StorageKey,
            _value: StorageValue,
        ) -> Result<(), StateError> {
            Ok(())
        }

        async fn get_code(&self, _address: Address) -> Result<Bytes, StateError> {
            Ok(Bytes::new())
        }

        async fn account_exists(&self, _address: Address) -> Result<bool, StateError> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_mock_state_access() {
        let state = MockStateAccess;
        let addr = Address::new([1u8; 20]);

        let balance = state.get_balance(addr).await.unwrap();
        assert_eq!(balance, U256::from(1000));

        let nonce = state.get_nonce(addr).await.unwrap();
        assert_eq!(nonce, 5);
    }
}
