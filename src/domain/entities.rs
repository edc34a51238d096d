//! # Core Domain Entities
//!
//! Main business entities for smart contract execution.
//! These represent the core concepts in the EVM execution domain.

use crate::domain::value_objects::{Address, Bytes, Hash, StorageKey, StorageValue, U256};
use serde::{Deserialize, Serialize};

// =============================================================================
// EXECUTION CONTEXT
// =============================================================================

/// Execution context for a contract call.
///
/// Contains all information needed to execute a contract:
/// - Caller/origin information
/// - Value transfer
/// - Gas limits
/// - Block context
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    /// Transaction sender (EOA that initiated the transaction).
    pub origin: Address,
    /// Current caller (may differ in nested calls).
    pub caller: Address,
    /// Contract being executed.
    pub address: Address,
    /// Value transferred (wei).
    pub value: U256,
    /// Input data (calldata).
    pub data: Bytes,
    /// Gas limit for this call.
    pub gas_limit: u64,
    /// Gas price.
    pub gas_price: U256,
    /// Block context.
    pub block: BlockContext,
    /// Call depth (for reentrancy limits).
    pub depth: u16,
    /// Is this a static call (no state changes allowed).
    pub is_static: bool,
}

impl ExecutionContext {
    /// Creates a new execution context for a top-level transaction.
    #[must_use]
    pub fn new_transaction(
        origin: Address,
        to: Address,
        value: U256,
        data: Bytes,
        gas_limit: u64,
        gas_price: U256,
        block: BlockContext,
    ) -> Self {
        Self {
            origin,
            caller: origin,
            address: to,
            value,
            data,
            gas_limit,
            gas_price,
            block,
            depth: 0,
            is_static: false,
        }
    }

    /// Creates a child context for a nested CALL.
    #[must_use]
    pub fn child_call(
        &self,
        caller: Address,
        address: Address,
        value: U256,
        data: Bytes,
        gas: u64,
    ) -> Self {
        Self {
            origin: self.origin,
            caller,
            address,
            value,
            data,
            gas_limit: gas,
            gas_price: self.gas_price,
            block: self.block.clone(),
            depth: self.depth.saturating_add(1),
            is_static: self.is_static,
        }
    }

    /// Creates a child context for DELEGATECALL.
    #[must_use]
    pub fn child_delegatecall(&self, _code_address: Address, data: Bytes, gas: u64) -> Self {
        Self {
            origin: self.origin,
            caller: self.caller, // Preserves caller
            address: self.address, // Preserves address
            value: self.value, // Preserves value
            data,
            gas_limit: gas,
            gas_price: self.gas_price,
            block: self.block.clone(),
            depth: self.depth.saturating_add(1),
            is_static: self.is_static,
        }
    }

    /// Creates a child context for STATICCALL.
    #[must_use]
    pub fn child_staticcall(&self, address: Address, data: Bytes, gas: u64) -> Self {
        Self {
            origin: self.origin,
            caller: self.address,
            address,
            value: U256::zero(),
            data,
            gas_limit: gas,
            gas_price: self.gas_price,
            block: self.block.clone(),
            depth: self.depth.saturating_add(1),
            is_static: true, // Static call enforced
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            origin: Address::ZERO,
            caller: Address::ZERO,
            address: Address::ZERO,
            value: U256::zero(),
            data: Bytes::new(),
            gas_limit: 0,
            gas_price: U256::zero(),
            block: BlockContext::default(),
            depth: 0,
            is_static: false,
        }
    }
}

// =============================================================================
// BLOCK CONTEXT
// =============================================================================

/// Block context for execution.
///
/// Provides access to block-level information during EVM execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockContext {
    /// Block number.
    pub number: u64,
    /// Block timestamp (unix seconds).
    pub timestamp: u64,
    /// Coinbase address (block proposer).
    pub coinbase: Address,
    /// Block difficulty (legacy, use prevrandao in PoS).
    pub difficulty: U256,
    /// Block gas limit.
    pub gas_limit: u64,
    /// Base fee (EIP-1559).
    pub base_fee: U256,
    /// Chain ID (EIP-155).
    pub chain_id: u64,
}

impl Default for BlockContext {
    fn default() -> Self {
        Self {
            number: 0,
            timestamp: 0,
            coinbase: Address::ZERO,
            difficulty: U256::zero(),
            gas_limit: 30_000_000,
            base_fee: U256::zero(),
            chain_id: 1,
        }
    }
}

// =============================================================================
// EXECUTION RESULT
// =============================================================================

/// Result of smart contract execution.
#[derive(Clone, Debug, Default)]
pub struct ExecutionResult {
    /// Whether execution succeeded.
    pub success: bool,
    /// Return data.
    pub output: Bytes,
    /// Gas used.
    pub gas_used: u64,
    /// Gas refund (for SSTORE clears).
    pub gas_refund: u64,
    /// State changes to apply.
    pub state_changes: Vec<StateChange>,
    /// Logs emitted.
    pub logs: Vec<Log>,
    /// Addresses to delete (SELFDESTRUCT), applied by the host at the end
    /// of the enclosing transaction.
    pub addresses_to_delete: Vec<Address>,
    /// Sub-calls made during execution (CREATE/CREATE2/CALL family).
    pub internal_txs: Vec<InternalTx>,
    /// Revert reason (if failed).
    pub revert_reason: Option<String>,
}

impl ExecutionResult {
    /// Creates a successful execution result.
    #[must_use]
    pub fn success(output: Bytes, gas_used: u64) -> Self {
        Self {
            success: true,
            output,
            gas_used,
            gas_refund: 0,
            state_changes: Vec::new(),
            logs: Vec::new(),
            addresses_to_delete: Vec::new(),
            internal_txs: Vec::new(),
            revert_reason: None,
        }
    }

    /// Creates a failed execution result.
    #[must_use]
    pub fn failure(reason: impl Into<String>, gas_used: u64) -> Self {
        Self {
            success: false,
            output: Bytes::new(),
            gas_used,
            gas_refund: 0,
            state_changes: Vec::new(),
            logs: Vec::new(),
            addresses_to_delete: Vec::new(),
            internal_txs: Vec::new(),
            revert_reason: Some(reason.into()),
        }
    }

    /// Creates an out-of-gas result.
    #[must_use]
    pub fn out_of_gas(gas_limit: u64) -> Self {
        Self::failure("out of gas", gas_limit)
    }

    /// Creates a revert result with data.
    #[must_use]
    pub fn revert(data: Bytes, gas_used: u64) -> Self {
        // Try to decode revert reason from data
        let reason = decode_revert_reason(&data);
        Self {
            success: false,
            output: data,
            gas_used,
            gas_refund: 0,
            state_changes: Vec::new(),
            logs: Vec::new(),
            addresses_to_delete: Vec::new(),
            internal_txs: Vec::new(),
            revert_reason: reason,
        }
    }
}

/// Attempts to decode a revert reason from output data.
fn decode_revert_reason(data: &Bytes) -> Option<String> {
    // Error(string) selector: 0x08c379a0
    if data.len() < 68 {
        return None;
    }

    let selector = &data.as_slice()[0..4];
    if selector != [0x08, 0xc3, 0x79, 0xa0] {
        return None;
    }

    // Decode string from ABI encoding
    // Skip selector (4) + offset (32) + length position
    let offset = 4 + 32;
    if data.len() < offset + 32 {
        return None;
    }

    // Read string length
    let len_bytes = &data.as_slice()[offset..offset + 32];
    let len = U256::from_big_endian(len_bytes).as_usize();

    if data.len() < offset + 32 + len {
        return None;
    }

    let string_bytes = &data.as_slice()[offset + 32..offset + 32 + len];
    String::from_utf8(string_bytes.to_vec()).ok()
}

// =============================================================================
// STATE CHANGE
// =============================================================================

/// State change from execution.
///
/// These changes are collected during execution and applied atomically
/// on success. On revert, all changes are discarded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateChange {
    /// Transfer balance between accounts.
    BalanceTransfer {
        from: Address,
        to: Address,
        amount: U256,
    },
    /// Write to contract storage.
    StorageWrite {
        address: Address,
        key: StorageKey,
        value: StorageValue,
    },
    /// Delete storage slot (set to zero).
    StorageDelete {
        address: Address,
        key: StorageKey,
    },
    /// Create a new contract.
    ContractCreate {
        address: Address,
        code: Bytes,
    },
    /// Self-destruct a contract.
    ContractDestroy {
        address: Address,
        beneficiary: Address,
    },
    /// Increment account nonce.
    NonceIncrement { address: Address },
}

// =============================================================================
// LOG (EVENT)
// =============================================================================

/// Emitted log (event) from contract execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    /// Contract address that emitted the log.
    pub address: Address,
    /// Indexed topics (up to 4).
    pub topics: Vec<Hash>,
    /// Non-indexed data.
    pub data: Bytes,
}

impl Log {
    /// Creates a new log.
    #[must_use]
    pub fn new(address: Address, topics: Vec<Hash>, data: Bytes) -> Self {
        Self {
            address,
            topics,
            data,
        }
    }
}

// =============================================================================
// INTERNAL TRANSACTION (CREATE/CALL TRACE)
// =============================================================================

/// Kind of sub-call that produced an [`InternalTx`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InternalTxKind {
    /// CREATE opcode.
    Create,
    /// CREATE2 opcode.
    Create2,
    /// CALL opcode.
    Call,
    /// CALLCODE opcode.
    CallCode,
    /// DELEGATECALL opcode.
    DelegateCall,
    /// STATICCALL opcode.
    StaticCall,
}

/// A record of a sub-call (CREATE/CREATE2/CALL family) made during
/// execution, recorded on success so a host can reconstruct a call trace
/// without re-running the interpreter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalTx {
    /// Which opcode produced this record.
    pub kind: InternalTxKind,
    /// The frame that initiated the sub-call.
    pub from: Address,
    /// The target address. `None` for CREATE/CREATE2 (the address is newly
    /// derived; callers read it off the stack push instead).
    pub to: Option<Address>,
    /// Gas made available to the sub-call.
    pub gas: u64,
    /// Calldata (CALL family) or init code (CREATE family).
    pub input: Bytes,
    /// Value transferred with the sub-call.
    pub value: U256,
}

// =============================================================================
// VM CONFIGURATION
// =============================================================================

/// Virtual machine configuration: execution limits plus the fork-gated
/// feature flags that select which instruction set and gas rules apply.
///
/// The limits (`max_call_depth`, `max_code_size`, ...) are DoS-prevention
/// ceilings a host chooses independently of consensus rules. The `bool`/
/// `Option` fields below ARE the consensus-relevant fork selection and
/// mirror the `EvmConfig` flags of the historical forks they're named
/// after; use one of the preset constructors rather than hand-assembling
/// a config unless emulating a non-standard network.
#[derive(Clone, Debug)]
pub struct VmConfig {
    /// Maximum call depth (default: 1024).
    pub max_call_depth: u16,
    /// Maximum code size in bytes (EIP-170: 24KB), `None` to disable.
    pub max_code_size: Option<usize>,
    /// Maximum init code size in bytes (EIP-3860: 48KB), `None` to disable.
    pub max_init_code_size: Option<usize>,
    /// Maximum stack size (default: 1024).
    pub max_stack_size: usize,
    /// Defensive host-side memory ceiling in bytes. Not a consensus rule;
    /// gas cost alone makes large expansions prohibitive, this just bounds
    /// worst-case host allocation.
    pub max_memory_size: usize,
    /// EVM version/fork (informational; behavior is driven by the flags
    /// below).
    pub evm_version: EvmVersion,
    /// EIP-150: forwarded child gas capped to at most `n-1/n` of the
    /// caller's remaining gas. `Some(64)` means the classic 63/64 rule.
    /// `None` forwards all remaining gas uncapped (pre-EIP-150).
    pub sub_gas_cap_divisor: Option<u64>,
    /// Treat CREATE running out of gas for the code deposit as a hard
    /// failure (Homestead+) rather than a soft partial success
    /// (pre-Homestead).
    pub exceptional_failed_code_deposit: bool,
    /// EIP-161: empty accounts (no code, zero nonce, zero balance) are not
    /// created implicitly by zero-value transfers.
    pub no_empty_accounts: bool,
    /// Charge `G_newaccount` for SELFDESTRUCT when the beneficiary account
    /// would otherwise be created for free.
    pub charge_selfdestruct_for_new_account: bool,
    /// EIP-2929: warm/cold access-list gas accounting for accounts and
    /// storage slots.
    pub access_lists: bool,
    /// EIP-1153: TLOAD/TSTORE transient storage.
    pub transient_storage: bool,
    /// EIP-3855: PUSH0 opcode.
    pub push0: bool,
    /// EIP-5656: MCOPY opcode.
    pub mcopy: bool,
    /// EIP-1014: CREATE2 opcode.
    pub create2: bool,
    /// EIP-3198: BASEFEE opcode.
    pub base_fee: bool,
    /// Whether SELFDESTRUCT grants a gas refund (removed by EIP-3529 in
    /// London).
    pub selfdestruct_refund: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::shanghai()
    }
}

impl VmConfig {
    /// Default block gas limit used for gas-estimation calls.
    pub const BLOCK_GAS_LIMIT: u64 = 30_000_000;

    /// Get maximum gas limit for estimation.
    #[must_use]
    pub fn max_gas_limit(&self) -> u64 {
        Self::BLOCK_GAS_LIMIT
    }

    /// Frontier baseline: no access lists, no PUSH0/MCOPY/CREATE2/BASEFEE,
    /// uncapped gas forwarding, soft CREATE-deposit failure.
    #[must_use]
    pub fn frontier() -> Self {
        Self {
            max_call_depth: 1024,
            max_code_size: None,
            max_init_code_size: None,
            max_stack_size: 1024,
            max_memory_size: 32 * 1024 * 1024,
            evm_version: EvmVersion::Istanbul,
            sub_gas_cap_divisor: None,
            exceptional_failed_code_deposit: false,
            no_empty_accounts: false,
            charge_selfdestruct_for_new_account: false,
            access_lists: false,
            transient_storage: false,
            push0: false,
            mcopy: false,
            create2: false,
            base_fee: false,
            selfdestruct_refund: true,
        }
    }

    /// Homestead: EIP-150 gas cap, hard CREATE-deposit failure.
    #[must_use]
    pub fn homestead() -> Self {
        Self {
            max_code_size: Some(24_576),
            sub_gas_cap_divisor: Some(64),
            exceptional_failed_code_deposit: true,
            ..Self::frontier()
        }
    }

    /// Byzantium/Constantinople/Istanbul: EIP-158/161 empty-account rules,
    /// EIP-684 create-collision already applies unconditionally (see
    /// [`crate::evm::interpreter`]), charge for SELFDESTRUCT new accounts.
    #[must_use]
    pub fn byzantium() -> Self {
        Self {
            no_empty_accounts: true,
            charge_selfdestruct_for_new_account: true,
            ..Self::homestead()
        }
    }

    /// Berlin: EIP-2929 warm/cold access lists.
    #[must_use]
    pub fn berlin() -> Self {
        Self {
            access_lists: true,
            evm_version: EvmVersion::Berlin,
            ..Self::byzantium()
        }
    }

    /// London: EIP-3198 BASEFEE, EIP-3529 removes the SELFDESTRUCT refund.
    #[must_use]
    pub fn london() -> Self {
        Self {
            base_fee: true,
            selfdestruct_refund: false,
            evm_version: EvmVersion::London,
            ..Self::berlin()
        }
    }

    /// Shanghai: EIP-3855 PUSH0. The default configuration; CREATE2
    /// (Constantinople) and MCOPY (Cancun/EIP-5656) and transient storage
    /// (Cancun/EIP-1153) are enabled here too since this crate does not
    /// model the Paris/Cancun split any more finely than its predecessors.
    #[must_use]
    pub fn shanghai() -> Self {
        Self {
            push0: true,
            mcopy: true,
            create2: true,
            transient_storage: true,
            max_init_code_size: Some(49_152),
            evm_version: EvmVersion::Shanghai,
            ..Self::london()
        }
    }
}

/// EVM hard fork version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EvmVersion {
    /// Istanbul hard fork.
    Istanbul,
    /// Berlin hard fork (EIP-2929 access lists).
    Berlin,
    /// London hard fork (EIP-1559 base fee).
    London,
    /// Paris hard fork (The Merge).
    Paris,
    /// Shanghai hard fork (withdrawals).
    #[default]
    Shanghai,
}

// =============================================================================
// ACCOUNT STATE (for StateAccess port)
// =============================================================================

/// Account state in the state trie.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccountState {
    /// Account balance.
    pub balance: U256,
    /// Account nonce.
    pub nonce: u64,
    /// Code hash (keccak256 of code, or empty hash for EOA).
    pub code_hash: Hash,
    /// Storage root (merkle root of storage trie).
    pub storage_root: Hash,
}

impl AccountState {
    /// Empty code hash (keccak256 of empty bytes).
    pub const EMPTY_CODE_HASH: Hash = Hash([
        0xc5, 0xd2, 0x46, 0x01, 0x86, 0xf7, 0x23, 0x3c,
        0x92, 0x7e, 0x7d, 0xb2, 0xdc, 0xc7, 0x03, 0xc0,
        0xe5, 0x00, 0xb6, 0x53, 0xca, 0x82, 0x27, 0x3b,
        0x7b, 0xfa, 0xd8, 0x04, 0x5d, 0x85, 0xa4, 0x70,
    ]);

    /// Creates a new empty EOA.
    #[must_use]
    pub fn new_eoa(balance: U256, nonce: u64) -> Self {
        Self {
            balance,
            nonce,
            code_hash: Self::EMPTY_CODE_HASH,
            storage_root: Hash::ZERO,
        }
    }

    /// Returns true if this is an EOA (externally owned account).
    #[must_use]
    pub fn is_eoa(&self) -> bool {
        self.code_hash == Self::EMPTY_CODE_HASH
    }

    /// Returns true if this is a contract.
    #[must_use]
    pub fn is_contract(&self) -> bool {
        !self.is_eoa()
    }

    /// Returns true if this account is empty (can be pruned).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.balance.is_zero()
            && self.nonce == 0
            && (self.code_hash == Self::EMPTY_CODE_HASH || self.code_hash == Hash::ZERO)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_context_child_call() {
        let parent = ExecutionContext {
            origin: Address::new([1u8; 20]),
            caller: Address::new([1u8; 20]),
            address: Address::new([2u8; 20]),
            value: U256::from(100),
            data: Bytes::from_slice(&[0x01, 0x02]),
            gas_limit: 1000,
            gas_price: U256::from(1),
            block: BlockContext::default(),
            depth: 0,
            is_static: false,
        };

        let child = parent.child_call(
            Address::new([2u8; 20]),
            Address::new([3u8; 20]),
            U256::from(50),
            Bytes::from_slice(&[0x03]),
            500,
        );

        assert_eq!(child.origin, parent.origin); // Origin preserved
        assert_eq!(child.caller, Address::new([2u8; 20]));
        assert_eq!(child.address, Address::new([3u8; 20]));
        assert_eq!(child.depth, 1);
        assert!(!child.is_static);
    }

    #[test]
    fn test_execution_context_staticcall() {
        let parent = ExecutionContext::default();
        let child = parent.child_staticcall(
            Address::new([1u8; 20]),
            Bytes::new(),
            100,
        );

        assert!(child.is_static);
        assert!(child.value.is_zero());
    }

    #[test]
    fn test_execution_result_success() {
        let result = ExecutionResult::success(
            Bytes::from_slice(&[0x01, 0x02]),
            21000,
        );

        assert!(result.success);
        assert_eq!(result.gas_used, 21000);
        assert!(result.revert_reason.is_none());
    }

    #[test]
    fn test_execution_result_failure() {
        let result = ExecutionResult::failure("test error", 10000);

        assert!(!result.success);
        assert_eq!(result.revert_reason, Some("test error".to_string()));
    }

    #[test]
    fn test_account_state_eoa() {
        let eoa = AccountState::new_eoa(U256::from(100), 5);
        assert!(eoa.is_eoa());
        assert!(!eoa.is_contract());
        assert!(!eoa.is_empty());
    }

    #[test]
    fn test_account_state_empty() {
        let empty = AccountState::default();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_vm_config_defaults() {
        let config = VmConfig::default();
        assert_eq!(config.max_call_depth, 1024);
        assert_eq!(config.max_code_size, Some(24_576));
        assert_eq!(config.max_init_code_size, Some(49_152));
        assert_eq!(config.max_stack_size, 1024);
        assert_eq!(config.max_memory_size, 32 * 1024 * 1024);
    }
}
