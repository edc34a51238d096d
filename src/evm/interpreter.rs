//! # EVM Interpreter
//!
//! The main execution engine for EVM bytecode.
//! Implements all opcodes and execution flow.

use crate::domain::entities::{
    ExecutionContext, ExecutionResult, InternalTx, InternalTxKind, Log, StateChange, VmConfig,
};
use crate::domain::services::{
    compute_contract_address, compute_contract_address_create2, keccak256,
};
use crate::domain::value_objects::{Address, Bytes, Hash, StorageKey, StorageValue, U256};
use crate::errors::VmError;
use crate::evm::gas::{self, costs, CallGasParams, OPCODE_GAS};
use crate::evm::memory::{memory_expansion_cost, Memory};
use crate::evm::opcodes::Opcode;
use crate::evm::stack::Stack;
use crate::evm::transient::TransientStorage;
use crate::ports::outbound::{AccessList, AccessStatus, StateAccess};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

/// Maximum execution steps to prevent infinite loops (safety limit).
const MAX_EXECUTION_STEPS: u64 = 10_000_000;

/// Maximum recursion depth for CALL/CREATE, mirrored from [`VmConfig`] but
/// enforced even when a host passes a config with a larger limit, since the
/// host's native call stack is finite too.
const HARD_CALL_DEPTH_LIMIT: u16 = 1024;

/// EVM Interpreter state.
pub struct Interpreter<'a, S, A>
where
    S: StateAccess,
    A: AccessList,
{
    /// Execution context.
    pub context: ExecutionContext,
    /// Contract bytecode.
    pub code: &'a [u8],
    /// Program counter.
    pub pc: usize,
    /// EVM stack.
    pub stack: Stack,
    /// EVM memory.
    pub memory: Memory,
    /// Return data from last call.
    pub return_data: Bytes,
    /// State changes accumulated.
    pub state_changes: Vec<StateChange>,
    /// Logs emitted.
    pub logs: Vec<Log>,
    /// Gas remaining.
    pub gas_remaining: u64,
    /// Gas refund accumulated.
    pub gas_refund: u64,
    /// State access interface.
    pub state: &'a S,
    /// Access list for warm/cold tracking.
    pub access_list: &'a mut A,
    /// Transient storage (EIP-1153), shared across the whole transaction.
    pub transient: &'a mut TransientStorage,
    /// Hard-fork feature flags and limits.
    pub config: &'a VmConfig,
    /// Addresses marked for deletion by SELFDESTRUCT, applied by the host
    /// once the enclosing transaction finishes.
    pub addresses_to_delete: Vec<Address>,
    /// Sub-calls made by CREATE/CREATE2/CALL family opcodes, recorded in
    /// execution order.
    pub internal_txs: Vec<InternalTx>,
    /// Valid jump destinations (cached).
    pub jump_dests: HashSet<usize>,
    /// Execution stopped flag.
    pub stopped: bool,
    /// Execution reverted flag.
    pub reverted: bool,
}

impl<'a, S, A> Interpreter<'a, S, A>
where
    S: StateAccess,
    A: AccessList,
{
    /// Create a new interpreter.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: ExecutionContext,
        code: &'a [u8],
        state: &'a S,
        access_list: &'a mut A,
        transient: &'a mut TransientStorage,
        config: &'a VmConfig,
    ) -> Self {
        let gas_remaining = context.gas_limit;
        let jump_dests = analyze_jump_dests(code);

        Self {
            context,
            code,
            pc: 0,
            stack: Stack::new(),
            memory: Memory::new(),
            return_data: Bytes::new(),
            state_changes: Vec::new(),
            logs: Vec::new(),
            gas_remaining,
            gas_refund: 0,
            state,
            access_list,
            transient,
            config,
            addresses_to_delete: Vec::new(),
            internal_txs: Vec::new(),
            jump_dests,
            stopped: false,
            reverted: false,
        }
    }

    /// Run [`Self::execute`] behind a heap-allocated, pinned future.
    ///
    /// CALL/CREATE need to recurse into a fresh interpreter's `execute`,
    /// which is itself `async fn`; calling it directly from within
    /// `execute_opcode` would make the compiler try to build a future that
    /// contains itself. Boxing breaks the cycle at the cost of one
    /// allocation per sub-call.
    fn execute_boxed(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionResult, VmError>> + Send + '_>>
    where
        S: Sync,
        A: Send,
    {
        Box::pin(self.execute())
    }

    /// Execute the bytecode and return the result.
    pub async fn execute(&mut self) -> Result<ExecutionResult, VmError> {
        let mut steps = 0u64;

        while !self.stopped && self.pc < self.code.len() {
            steps += 1;
            if steps > MAX_EXECUTION_STEPS {
                return Err(VmError::Timeout {
                    elapsed_ms: 0,
                    max_ms: 5000,
                });
            }

            let opcode_byte = self.code[self.pc];
            let opcode = Opcode::from_byte(opcode_byte);

            // Check for invalid opcode
            let opcode = match opcode {
                Some(op) => op,
                None => return Err(VmError::InvalidOpcode(opcode_byte)),
            };

            // Stack depth must be validated before gas is charged: an
            // opcode run against an empty stack reports StackUnderflow,
            // never OutOfGas, even when gas is also insufficient.
            let (pops, pushes) = opcode.stack_io();
            if self.stack.len() < pops {
                return Err(VmError::StackUnderflow);
            }
            if self.stack.len() - pops + pushes > crate::evm::stack::MAX_STACK_SIZE {
                return Err(VmError::StackOverflow);
            }

            // Consume base gas
            let base_gas = OPCODE_GAS[opcode_byte as usize];
            if !self.consume_gas(base_gas) {
                return Err(VmError::OutOfGas);
            }

            // Execute the opcode
            self.execute_opcode(opcode).await?;
        }

        // Build result
        let gas_used = self.context.gas_limit - self.gas_remaining;

        if self.reverted {
            Ok(ExecutionResult::revert(self.return_data.clone(), gas_used))
        } else {
            Ok(ExecutionResult {
                success: true,
                output: self.return_data.clone(),
                gas_used,
                gas_refund: self.gas_refund,
                state_changes: std::mem::take(&mut self.state_changes),
                logs: std::mem::take(&mut self.logs),
                addresses_to_delete: std::mem::take(&mut self.addresses_to_delete),
                internal_txs: std::mem::take(&mut self.internal_txs),
                revert_reason: None,
            })
        }
    }

    /// Converts a stack-popped `U256` offset/size into a `usize`, without
    /// ever calling the panicking `U256::as_usize()` on an out-of-range
    /// value. Any value beyond the memory ceiling is rejected up front,
    /// since memory expansion would reject it anyway.
    fn checked_usize(value: U256) -> Result<usize, VmError> {
        if value > U256::from(crate::evm::memory::MAX_MEMORY_SIZE) {
            return Err(VmError::MemoryLimitExceeded {
                requested: usize::MAX,
                max: crate::evm::memory::MAX_MEMORY_SIZE,
            });
        }
        Ok(value.as_usize())
    }

    /// Converts a `U256` jump destination to `usize`, saturating instead of
    /// panicking on out-of-range values. A saturated destination can never
    /// match a real `JUMPDEST`, so it naturally falls through to
    /// `VmError::InvalidJump`.
    fn saturating_usize(value: U256) -> usize {
        if value > U256::from(usize::MAX) {
            usize::MAX
        } else {
            value.as_usize()
        }
    }

    /// Consume gas, returning false if insufficient.
    fn consume_gas(&mut self, amount: u64) -> bool {
        if amount > self.gas_remaining {
            self.gas_remaining = 0;
            false
        } else {
            self.gas_remaining -= amount;
            true
        }
    }

    /// Charge cold/warm account-access gas for BALANCE/EXTCODE*/CALL-family
    /// opcodes that read a foreign account (EIP-2929). When access lists are
    /// disabled (pre-Berlin configs) the access is always treated as warm,
    /// since the fixed pre-Berlin opcode cost already covers it.
    fn charge_account_access(&mut self, address: Address) -> Result<(), VmError> {
        if !self.config.access_lists {
            return Ok(());
        }
        let is_cold = self.access_list.touch_account(address) == AccessStatus::Cold;
        let gas = if is_cold {
            costs::COLD_ACCOUNT_ACCESS
        } else {
            costs::WARM_ACCOUNT_ACCESS
        };
        if !self.consume_gas(gas) {
            return Err(VmError::OutOfGas);
        }
        Ok(())
    }

    /// CREATE / CREATE2.
    async fn exec_create(&mut self, is_create2: bool) -> Result<(), VmError>
    where
        S: Sync,
        A: Send,
    {
        if self.context.is_static {
            return Err(VmError::WriteInStaticContext);
        }

        let value = self.stack.pop()?;
        let offset = Self::checked_usize(self.stack.pop()?)?;
        let size = Self::checked_usize(self.stack.pop()?)?;
        let salt = if is_create2 {
            Some(self.stack.pop()?)
        } else {
            None
        };

        if let Some(max) = self.config.max_init_code_size {
            if size > max {
                return Err(VmError::InitCodeSizeExceeded { size, max });
            }
        }

        let words_added = self.memory.expand(offset + size)?;
        let mem_gas = memory_expansion_cost(
            self.memory.word_size() - words_added,
            self.memory.word_size(),
        );
        if !self.consume_gas(mem_gas) {
            return Err(VmError::OutOfGas);
        }

        let mut create_gas = gas::create_gas_cost(size);
        if is_create2 {
            create_gas += costs::KECCAK256_WORD * size.div_ceil(32) as u64;
        }
        if !self.consume_gas(create_gas) {
            return Err(VmError::OutOfGas);
        }

        let init_code = self.memory.read_bytes(offset, size);

        if self.context.depth + 1 > self.config.max_call_depth.min(HARD_CALL_DEPTH_LIMIT) {
            self.stack.push(U256::zero())?;
            return Ok(());
        }

        let caller_balance = self.state.get_balance(self.context.address).await?;
        if value > caller_balance {
            self.stack.push(U256::zero())?;
            return Ok(());
        }

        let sender_nonce = self.state.get_nonce(self.context.address).await?;
        let new_address = match salt {
            Some(salt_val) => {
                let mut salt_bytes = [0u8; 32];
                salt_val.to_big_endian(&mut salt_bytes);
                compute_contract_address_create2(
                    self.context.address,
                    Hash::new(salt_bytes),
                    &init_code,
                )
            }
            None => compute_contract_address(self.context.address, sender_nonce),
        };

        if self.state.non_empty_code_or_nonce(new_address).await? {
            self.stack.push(U256::zero())?;
            return Ok(());
        }

        let child_gas = match self.config.sub_gas_cap_divisor {
            Some(divisor) => self.gas_remaining - self.gas_remaining / divisor,
            None => self.gas_remaining,
        };
        self.gas_remaining -= child_gas;

        self.state_changes.push(StateChange::NonceIncrement {
            address: self.context.address,
        });
        if !value.is_zero() {
            self.state_changes.push(StateChange::BalanceTransfer {
                from: self.context.address,
                to: new_address,
                amount: value,
            });
        }

        let child_context = ExecutionContext {
            origin: self.context.origin,
            caller: self.context.address,
            address: new_address,
            value,
            data: Bytes::new(),
            gas_limit: child_gas,
            gas_price: self.context.gas_price,
            block: self.context.block.clone(),
            depth: self.context.depth + 1,
            is_static: false,
        };

        let mut child = Interpreter::new(
            child_context,
            init_code.as_slice(),
            self.state,
            &mut *self.access_list,
            &mut *self.transient,
            self.config,
        );
        let result = child
            .execute_boxed()
            .await
            .unwrap_or_else(|_| ExecutionResult::failure("create reverted", child_gas));

        let leftover_gas = child_gas.saturating_sub(result.gas_used);
        self.gas_remaining += leftover_gas;
        self.gas_refund += result.gas_refund;

        self.internal_txs.push(InternalTx {
            kind: if is_create2 {
                InternalTxKind::Create2
            } else {
                InternalTxKind::Create
            },
            from: self.context.address,
            to: None,
            gas: child_gas,
            input: Bytes::from_vec(init_code),
            value,
        });

        if !result.success {
            self.stack.push(U256::zero())?;
            return Ok(());
        }

        let code = result.output;
        let code_valid = code.as_slice().first() != Some(&0xEF)
            && self.config.max_code_size.is_none_or(|max| code.len() <= max);

        if !code_valid {
            self.stack.push(U256::zero())?;
            return Ok(());
        }

        // Pre-Homestead (no exceptional_failed_code_deposit), an
        // under-funded deposit still deploys whatever code fits; Homestead
        // onward treats it as a failed creation (EIP-2).
        let deposit_gas = costs::CODE_DEPOSIT * code.len() as u64;
        if deposit_gas > self.gas_remaining {
            if self.config.exceptional_failed_code_deposit {
                self.gas_remaining = 0;
                self.stack.push(U256::zero())?;
                return Ok(());
            }
        } else {
            self.gas_remaining -= deposit_gas;
        }

        self.state_changes.push(StateChange::ContractCreate {
            address: new_address,
            code,
        });

        let mut addr_bytes = [0u8; 32];
        addr_bytes[12..].copy_from_slice(new_address.as_bytes());
        self.stack.push(U256::from_big_endian(&addr_bytes))?;
        Ok(())
    }

    /// CALL / CALLCODE / DELEGATECALL / STATICCALL.
    async fn exec_call(&mut self, opcode: Opcode) -> Result<(), VmError>
    where
        S: Sync,
        A: Send,
    {
        let requested_gas = self.stack.pop()?;
        let target_addr = u256_to_address(self.stack.pop()?);
        let value = match opcode {
            Opcode::Call | Opcode::CallCode => self.stack.pop()?,
            _ => U256::zero(),
        };

        if value > U256::zero() && self.context.is_static && opcode == Opcode::Call {
            return Err(VmError::WriteInStaticContext);
        }

        let in_offset = Self::checked_usize(self.stack.pop()?)?;
        let in_size = Self::checked_usize(self.stack.pop()?)?;
        let out_offset = Self::checked_usize(self.stack.pop()?)?;
        let out_size = Self::checked_usize(self.stack.pop()?)?;

        let in_words_added = self.memory.expand(in_offset + in_size)?;
        let mut mem_gas = memory_expansion_cost(
            self.memory.word_size() - in_words_added,
            self.memory.word_size(),
        );
        let out_words_added = self.memory.expand(out_offset + out_size)?;
        mem_gas += memory_expansion_cost(
            self.memory.word_size() - out_words_added,
            self.memory.word_size(),
        );
        if !self.consume_gas(mem_gas) {
            return Err(VmError::OutOfGas);
        }

        let is_cold = self.config.access_lists
            && self.access_list.touch_account(target_addr) == AccessStatus::Cold;
        let has_value = !value.is_zero();
        let is_empty = has_value && self.state.is_account_dead(target_addr).await?;

        let access_gas = gas::call_gas_cost(&CallGasParams {
            is_cold,
            has_value,
            is_empty,
        });
        if !self.consume_gas(access_gas) {
            return Err(VmError::OutOfGas);
        }

        if self.context.depth + 1 > self.config.max_call_depth.min(HARD_CALL_DEPTH_LIMIT) {
            self.stack.push(U256::zero())?;
            return Ok(());
        }

        if matches!(opcode, Opcode::Call | Opcode::CallCode) {
            let caller_balance = self.state.get_balance(self.context.address).await?;
            if value > caller_balance {
                self.stack.push(U256::zero())?;
                return Ok(());
            }
        }

        // The 63/64 split and the value stipend are computed once by
        // `calculate_call_gas`; the amount actually deducted from the
        // caller excludes the stipend, which is credited to the callee
        // for free.
        let requested = requested_gas.as_u64();
        let child_gas = gas::calculate_call_gas(self.gas_remaining, requested, has_value);
        let charged = if has_value {
            child_gas.saturating_sub(costs::CALL_STIPEND)
        } else {
            child_gas
        }
        .min(self.gas_remaining);
        self.gas_remaining -= charged;

        let call_data = Bytes::from_vec(self.memory.read_bytes(in_offset, in_size));

        let child_context = match opcode {
            Opcode::Call => self.context.child_call(
                self.context.address,
                target_addr,
                value,
                call_data.clone(),
                child_gas,
            ),
            Opcode::CallCode => ExecutionContext {
                origin: self.context.origin,
                caller: self.context.address,
                address: self.context.address,
                value,
                data: call_data.clone(),
                gas_limit: child_gas,
                gas_price: self.context.gas_price,
                block: self.context.block.clone(),
                depth: self.context.depth + 1,
                is_static: self.context.is_static,
            },
            Opcode::DelegateCall => {
                self.context
                    .child_delegatecall(target_addr, call_data.clone(), child_gas)
            }
            Opcode::StaticCall => {
                self.context
                    .child_staticcall(target_addr, call_data.clone(), child_gas)
            }
            _ => unreachable!(),
        };

        if matches!(opcode, Opcode::Call) && !value.is_zero() {
            self.state_changes.push(StateChange::BalanceTransfer {
                from: self.context.address,
                to: target_addr,
                amount: value,
            });
        }

        let code = self.state.get_code(target_addr).await?;
        let mut child = Interpreter::new(
            child_context,
            code.as_slice(),
            self.state,
            &mut *self.access_list,
            &mut *self.transient,
            self.config,
        );
        let result = child
            .execute_boxed()
            .await
            .unwrap_or_else(|_| ExecutionResult::failure("call failed", child_gas));

        let leftover_gas = child_gas.saturating_sub(result.gas_used);
        self.gas_remaining += leftover_gas;

        if result.success {
            self.gas_refund += result.gas_refund;
            self.state_changes.extend(result.state_changes.iter().cloned());
            self.logs.extend(result.logs.iter().cloned());
            self.addresses_to_delete
                .extend(result.addresses_to_delete.iter().copied());
            self.internal_txs.extend(result.internal_txs.iter().cloned());
        }

        self.internal_txs.push(InternalTx {
            kind: match opcode {
                Opcode::Call => InternalTxKind::Call,
                Opcode::CallCode => InternalTxKind::CallCode,
                Opcode::DelegateCall => InternalTxKind::DelegateCall,
                Opcode::StaticCall => InternalTxKind::StaticCall,
                _ => unreachable!(),
            },
            from: self.context.address,
            to: Some(target_addr),
            gas: child_gas,
            input: call_data,
            value,
        });

        self.return_data = result.output.clone();
        let copy_size = out_size.min(result.output.len());
        if copy_size > 0 {
            self.memory
                .write_bytes(out_offset, &result.output.as_slice()[..copy_size])?;
        }

        self.stack
            .push(if result.success { U256::one() } else { U256::zero() })?;
        Ok(())
    }

    /// Execute a single opcode.
    async fn execute_opcode(&mut self, opcode: Opcode) -> Result<(), VmError> {
        self.pc += 1;

        match opcode {
            // =================================================================
            // STOP & ARITHMETIC
            // =================================================================
            Opcode::Stop => {
                self.stopped = true;
            }

            Opcode::Add => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack.push(a.overflowing_add(b).0)?;
            }

            Opcode::Mul => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack.push(a.overflowing_mul(b).0)?;
            }

            Opcode::Sub => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack.push(a.overflowing_sub(b).0)?;
            }

            Opcode::Div => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                let result = if b.is_zero() { U256::zero() } else { a / b };
                self.stack.push(result)?;
            }

            Opcode::SDiv => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                let result = if b.is_zero() {
                    U256::zero()
                } else {
                    signed_div(a, b)
                };
                self.stack.push(result)?;
            }

            Opcode::Mod => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                let result = if b.is_zero() { U256::zero() } else { a % b };
                self.stack.push(result)?;
            }

            Opcode::SMod => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                let result = if b.is_zero() {
                    U256::zero()
                } else {
                    signed_mod(a, b)
                };
                self.stack.push(result)?;
            }

            Opcode::AddMod => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                let n = self.stack.pop()?;
                let result = if n.is_zero() {
                    U256::zero()
                } else {
                    // Use 512-bit arithmetic to prevent overflow
                    let sum = u256_to_u512(a) + u256_to_u512(b);
                    let result = sum % u256_to_u512(n);
                    u512_to_u256(result)
                };
                self.stack.push(result)?;
            }

            Opcode::MulMod => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                let n = self.stack.pop()?;
                let result = if n.is_zero() {
                    U256::zero()
                } else {
                    // Use 512-bit arithmetic
                    let prod = u256_to_u512(a) * u256_to_u512(b);
                    let result = prod % u256_to_u512(n);
                    u512_to_u256(result)
                };
                self.stack.push(result)?;
            }

            Opcode::Exp => {
                let base = self.stack.pop()?;
                let exp = self.stack.pop()?;

                // Dynamic gas cost
                let exp_gas = gas::exp_gas_cost(exp) - costs::EXP;
                if !self.consume_gas(exp_gas) {
                    return Err(VmError::OutOfGas);
                }

                let result = exp_by_squaring(base, exp);
                self.stack.push(result)?;
            }

            Opcode::SignExtend => {
                let k = self.stack.pop()?;
                let x = self.stack.pop()?;

                let result = if k < U256::from(32) {
                    let k = k.as_usize();
                    let bit_index = 8 * k + 7;
                    let bit = x.bit(bit_index);
                    let mask = (U256::one() << (bit_index + 1)) - 1;
                    if bit {
                        x | !mask
                    } else {
                        x & mask
                    }
                } else {
                    x
                };
                self.stack.push(result)?;
            }

            // =================================================================
            // COMPARISON & BITWISE
            // =================================================================
            Opcode::Lt => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack
                    .push(if a < b { U256::one() } else { U256::zero() })?;
            }

            Opcode::Gt => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack
                    .push(if a > b { U256::one() } else { U256::zero() })?;
            }

            Opcode::SLt => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                let result = if signed_lt(a, b) {
                    U256::one()
                } else {
                    U256::zero()
                };
                self.stack.push(result)?;
            }

            Opcode::SGt => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                let result = if signed_lt(b, a) {
                    U256::one()
                } else {
                    U256::zero()
                };
                self.stack.push(result)?;
            }

            Opcode::Eq => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack
                    .push(if a == b { U256::one() } else { U256::zero() })?;
            }

            Opcode::IsZero => {
                let a = self.stack.pop()?;
                self.stack.push(if a.is_zero() {
                    U256::one()
                } else {
                    U256::zero()
                })?;
            }

            Opcode::And => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack.push(a & b)?;
            }

            Opcode::Or => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack.push(a | b)?;
            }

            Opcode::Xor => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack.push(a ^ b)?;
            }

            Opcode::Not => {
                let a = self.stack.pop()?;
                self.stack.push(!a)?;
            }

            Opcode::Byte => {
                let i = self.stack.pop()?;
                let x = self.stack.pop()?;
                let result = if i < U256::from(32) {
                    let byte_index = 31 - i.as_usize();
                    let mut bytes = [0u8; 32];
                    x.to_big_endian(&mut bytes);
                    U256::from(bytes[31 - byte_index])
                } else {
                    U256::zero()
                };
                self.stack.push(result)?;
            }

            Opcode::Shl => {
                let shift = self.stack.pop()?;
                let value = self.stack.pop()?;
                let result = if shift >= U256::from(256) {
                    U256::zero()
                } else {
                    value << shift.as_usize()
                };
                self.stack.push(result)?;
            }

            Opcode::Shr => {
                let shift = self.stack.pop()?;
                let value = self.stack.pop()?;
                let result = if shift >= U256::from(256) {
                    U256::zero()
                } else {
                    value >> shift.as_usize()
                };
                self.stack.push(result)?;
            }

            Opcode::Sar => {
                let shift = self.stack.pop()?;
                let value = self.stack.pop()?;
                let result = sar(value, shift);
                self.stack.push(result)?;
            }

            // =================================================================
            // KECCAK256
            // =================================================================
            Opcode::Keccak256 => {
                let offset = Self::checked_usize(self.stack.pop()?)?;
                let size = Self::checked_usize(self.stack.pop()?)?;

                // Memory expansion gas
                let words_added = self.memory.expand(offset + size)?;
                let mem_gas = memory_expansion_cost(
                    self.memory.word_size() - words_added,
                    self.memory.word_size(),
                );
                if !self.consume_gas(mem_gas) {
                    return Err(VmError::OutOfGas);
                }

                // Hash cost
                let hash_gas = gas::keccak256_gas_cost(size) - costs::KECCAK256;
                if !self.consume_gas(hash_gas) {
                    return Err(VmError::OutOfGas);
                }

                let data = self.memory.read_bytes(offset, size);
                let hash = keccak256(&data);
                self.stack.push(U256::from_big_endian(hash.as_bytes()))?;
            }

            // =================================================================
            // ENVIRONMENTAL INFORMATION
            // =================================================================
            Opcode::Address => {
                let mut bytes = [0u8; 32];
                bytes[12..].copy_from_slice(self.context.address.as_bytes());
                self.stack.push(U256::from_big_endian(&bytes))?;
            }

            Opcode::Balance => {
                let addr_val = self.stack.pop()?;
                let addr = u256_to_address(addr_val);

                // Check warm/cold
                let is_cold = self.access_list.touch_account(addr) == AccessStatus::Cold;
                let gas = if is_cold {
                    costs::COLD_ACCOUNT_ACCESS
                } else {
                    costs::WARM_ACCOUNT_ACCESS
                };
                if !self.consume_gas(gas) {
                    return Err(VmError::OutOfGas);
                }

                let balance = self.state.get_balance(addr).await?;
                self.stack.push(balance)?;
            }

            Opcode::Origin => {
                let mut bytes = [0u8; 32];
                bytes[12..].copy_from_slice(self.context.origin.as_bytes());
                self.stack.push(U256::from_big_endian(&bytes))?;
            }

            Opcode::Caller => {
                let mut bytes = [0u8; 32];
                bytes[12..].copy_from_slice(self.context.caller.as_bytes());
                self.stack.push(U256::from_big_endian(&bytes))?;
            }

            Opcode::CallValue => {
                self.stack.push(self.context.value)?;
            }

            Opcode::CallDataLoad => {
                let offset = Self::checked_usize(self.stack.pop()?)?;
                let data = &self.context.data;
                let mut result = [0u8; 32];

                for (i, byte) in result.iter_mut().enumerate() {
                    let pos = offset.saturating_add(i);
                    if pos < data.len() {
                        *byte = data.as_slice()[pos];
                    }
                }

                self.stack.push(U256::from_big_endian(&result))?;
            }

            Opcode::CallDataSize => {
                self.stack.push(U256::from(self.context.data.len()))?;
            }

            Opcode::CallDataCopy => {
                let dest_offset = Self::checked_usize(self.stack.pop()?)?;
                let data_offset = Self::checked_usize(self.stack.pop()?)?;
                let size = Self::checked_usize(self.stack.pop()?)?;

                // Memory expansion
                let words_added = self.memory.expand(dest_offset + size)?;
                let mem_gas = memory_expansion_cost(
                    self.memory.word_size() - words_added,
                    self.memory.word_size(),
                );
                if !self.consume_gas(mem_gas) {
                    return Err(VmError::OutOfGas);
                }

                // Copy gas
                let copy_gas = gas::copy_gas_cost(size);
                if !self.consume_gas(copy_gas) {
                    return Err(VmError::OutOfGas);
                }

                // Copy data with zero padding
                let data = &self.context.data;
                for i in 0..size {
                    let byte = if data_offset + i < data.len() {
                        data.as_slice()[data_offset + i]
                    } else {
                        0
                    };
                    self.memory.write_byte(dest_offset + i, byte)?;
                }
            }

            Opcode::CodeSize => {
                self.stack.push(U256::from(self.code.len()))?;
            }

            Opcode::CodeCopy => {
                let dest_offset = Self::checked_usize(self.stack.pop()?)?;
                let code_offset = Self::checked_usize(self.stack.pop()?)?;
                let size = Self::checked_usize(self.stack.pop()?)?;

                // Memory expansion
                let words_added = self.memory.expand(dest_offset + size)?;
                let mem_gas = memory_expansion_cost(
                    self.memory.word_size() - words_added,
                    self.memory.word_size(),
                );
                if !self.consume_gas(mem_gas) {
                    return Err(VmError::OutOfGas);
                }

                // Copy gas
                let copy_gas = gas::copy_gas_cost(size);
                if !self.consume_gas(copy_gas) {
                    return Err(VmError::OutOfGas);
                }

                // Copy code with zero padding
                for i in 0..size {
                    let byte = if code_offset + i < self.code.len() {
                        self.code[code_offset + i]
                    } else {
                        0
                    };
                    self.memory.write_byte(dest_offset + i, byte)?;
                }
            }

            Opcode::GasPrice => {
                self.stack.push(self.context.gas_price)?;
            }

            Opcode::ReturnDataSize => {
                self.stack.push(U256::from(self.return_data.len()))?;
            }

            Opcode::ReturnDataCopy => {
                let dest_offset = Self::checked_usize(self.stack.pop()?)?;
                let data_offset = Self::checked_usize(self.stack.pop()?)?;
                let size = Self::checked_usize(self.stack.pop()?)?;

                // Check bounds
                if data_offset.saturating_add(size) > self.return_data.len() {
                    return Err(VmError::ReturnDataOutOfBounds {
                        offset: data_offset,
                        size,
                        available: self.return_data.len(),
                    });
                }

                // Memory expansion
                let words_added = self.memory.expand(dest_offset + size)?;
                let mem_gas = memory_expansion_cost(
                    self.memory.word_size() - words_added,
                    self.memory.word_size(),
                );
                if !self.consume_gas(mem_gas) {
                    return Err(VmError::OutOfGas);
                }

                // Copy gas
                let copy_gas = gas::copy_gas_cost(size);
                if !self.consume_gas(copy_gas) {
                    return Err(VmError::OutOfGas);
                }

                // Copy return data
                let data = &self.return_data.as_slice()[data_offset..data_offset + size];
                self.memory.write_bytes(dest_offset, data)?;
            }

            // =================================================================
            // BLOCK INFORMATION
            // =================================================================
            Opcode::BlockHash => {
                let number = self.stack.pop()?;
                // Only last 256 blocks available
                let current = self.context.block.number;
                let result = if number >= U256::from(current)
                    || number < U256::from(current.saturating_sub(256))
                {
                    None
                } else {
                    self.state
                        .get_block_hash(number.as_u64(), current)
                        .await?
                };
                let result = result.map_or(U256::zero(), |h| U256::from_big_endian(h.as_bytes()));
                self.stack.push(result)?;
            }

            Opcode::Coinbase => {
                let mut bytes = [0u8; 32];
                bytes[12..].copy_from_slice(self.context.block.coinbase.as_bytes());
                self.stack.push(U256::from_big_endian(&bytes))?;
            }

            Opcode::Timestamp => {
                self.stack.push(U256::from(self.context.block.timestamp))?;
            }

            Opcode::Number => {
                self.stack.push(U256::from(self.context.block.number))?;
            }

            Opcode::PrevRandao => {
                self.stack.push(self.context.block.difficulty)?;
            }

            Opcode::GasLimit => {
                self.stack.push(U256::from(self.context.block.gas_limit))?;
            }

            Opcode::ChainId => {
                self.stack.push(U256::from(self.context.block.chain_id))?;
            }

            Opcode::SelfBalance => {
                let balance = self.state.get_balance(self.context.address).await?;
                self.stack.push(balance)?;
            }

            Opcode::BaseFee => {
                self.stack.push(self.context.block.base_fee)?;
            }

            // =================================================================
            // STACK, MEMORY, STORAGE
            // =================================================================
            Opcode::Pop => {
                self.stack.pop()?;
            }

            Opcode::MLoad => {
                let offset = Self::checked_usize(self.stack.pop()?)?;

                // Memory expansion
                let words_added = self.memory.expand(offset + 32)?;
                let mem_gas = memory_expansion_cost(
                    self.memory.word_size() - words_added,
                    self.memory.word_size(),
                );
                if !self.consume_gas(mem_gas) {
                    return Err(VmError::OutOfGas);
                }

                let value = self.memory.read_word(offset);
                self.stack.push(U256::from_big_endian(&value))?;
            }

            Opcode::MStore => {
                let offset = Self::checked_usize(self.stack.pop()?)?;
                let value = self.stack.pop()?;

                // Memory expansion
                let words_added = self.memory.expand(offset + 32)?;
                let mem_gas = memory_expansion_cost(
                    self.memory.word_size() - words_added,
                    self.memory.word_size(),
                );
                if !self.consume_gas(mem_gas) {
                    return Err(VmError::OutOfGas);
                }

                let mut bytes = [0u8; 32];
                value.to_big_endian(&mut bytes);
                self.memory.write_word(offset, &bytes)?;
            }

            Opcode::MStore8 => {
                let offset = Self::checked_usize(self.stack.pop()?)?;
                let value = self.stack.pop()?;

                // Memory expansion
                let words_added = self.memory.expand(offset + 1)?;
                let mem_gas = memory_expansion_cost(
                    self.memory.word_size() - words_added,
                    self.memory.word_size(),
                );
                if !self.consume_gas(mem_gas) {
                    return Err(VmError::OutOfGas);
                }

                self.memory.write_byte(offset, value.byte(0))?;
            }

            Opcode::SLoad => {
                let key = self.stack.pop()?;
                let storage_key = StorageKey::from_u256(key);

                // Check warm/cold
                let is_cold = self
                    .access_list
                    .touch_storage(self.context.address, storage_key)
                    == AccessStatus::Cold;
                let gas = if is_cold {
                    costs::COLD_SLOAD
                } else {
                    costs::WARM_SLOAD
                };
                if !self.consume_gas(gas) {
                    return Err(VmError::OutOfGas);
                }

                let value = self
                    .state
                    .get_storage(self.context.address, storage_key)
                    .await?;
                self.stack.push(value.to_u256())?;
            }

            Opcode::SStore => {
                if self.context.is_static {
                    return Err(VmError::WriteInStaticContext);
                }

                let key = self.stack.pop()?;
                let value = self.stack.pop()?;
                let storage_key = StorageKey::from_u256(key);
                let storage_value = StorageValue::from_u256(value);

                // Check warm/cold (SSTORE has complex gas rules)
                let is_cold = self
                    .access_list
                    .touch_storage(self.context.address, storage_key)
                    == AccessStatus::Cold;
                if is_cold
                    && !self.consume_gas(costs::COLD_SLOAD) {
                    return Err(VmError::OutOfGas);
                }

                let old_value = self
                    .state
                    .get_storage(self.context.address, storage_key)
                    .await?
                    .to_u256();

                let gas = if old_value.is_zero() && !value.is_zero() {
                    costs::SSTORE_SET
                } else {
                    costs::SSTORE_RESET
                };
                if !self.consume_gas(gas) {
                    return Err(VmError::OutOfGas);
                }

                if !old_value.is_zero() && value.is_zero() {
                    self.gas_refund += costs::SSTORE_CLEAR_REFUND;
                }

                self.state_changes.push(StateChange::StorageWrite {
                    address: self.context.address,
                    key: storage_key,
                    value: storage_value,
                });
            }

            Opcode::Jump => {
                let dest = Self::saturating_usize(self.stack.pop()?);
                if !self.jump_dests.contains(&dest) {
                    return Err(VmError::InvalidJump(dest));
                }
                self.pc = dest;
            }

            Opcode::JumpI => {
                let dest = Self::saturating_usize(self.stack.pop()?);
                let condition = self.stack.pop()?;
                if !condition.is_zero() {
                    if !self.jump_dests.contains(&dest) {
                        return Err(VmError::InvalidJump(dest));
                    }
                    self.pc = dest;
                }
            }

            Opcode::Pc => {
                self.stack.push(U256::from(self.pc - 1))?;
            }

            Opcode::MSize => {
                self.stack.push(U256::from(self.memory.len()))?;
            }

            Opcode::Gas => {
                self.stack.push(U256::from(self.gas_remaining))?;
            }

            Opcode::JumpDest => {
                // No-op, just a marker
            }

            // =================================================================
            // PUSH OPERATIONS
            // =================================================================
            Opcode::Push0 => {
                self.stack.push(U256::zero())?;
            }

            Opcode::Push1
            | Opcode::Push2
            | Opcode::Push3
            | Opcode::Push4
            | Opcode::Push5
            | Opcode::Push6
            | Opcode::Push7
            | Opcode::Push8
            | Opcode::Push9
            | Opcode::Push10
            | Opcode::Push11
            | Opcode::Push12
            | Opcode::Push13
            | Opcode::Push14
            | Opcode::Push15
            | Opcode::Push16
            | Opcode::Push17
            | Opcode::Push18
            | Opcode::Push19
            | Opcode::Push20
            | Opcode::Push21
            | Opcode::Push22
            | Opcode::Push23
            | Opcode::Push24
            | Opcode::Push25
            | Opcode::Push26
            | Opcode::Push27
            | Opcode::Push28
            | Opcode::Push29
            | Opcode::Push30
            | Opcode::Push31
            | Opcode::Push32 => {
                let size = opcode.push_size().unwrap_or(0);
                let mut bytes = [0u8; 32];
                let end = (self.pc + size).min(self.code.len());
                let data_len = end - self.pc;
                if data_len > 0 {
                    bytes[32 - size..32 - size + data_len]
                        .copy_from_slice(&self.code[self.pc..end]);
                }
                self.stack.push(U256::from_big_endian(&bytes))?;
                self.pc += size;
            }

            // =================================================================
            // DUP OPERATIONS
            // =================================================================
            Opcode::Dup1 => self.stack.dup(0)?,
            Opcode::Dup2 => self.stack.dup(1)?,
            Opcode::Dup3 => self.stack.dup(2)?,
            Opcode::Dup4 => self.stack.dup(3)?,
            Opcode::Dup5 => self.stack.dup(4)?,
            Opcode::Dup6 => self.stack.dup(5)?,
            Opcode::Dup7 => self.stack.dup(6)?,
            Opcode::Dup8 => self.stack.dup(7)?,
            Opcode::Dup9 => self.stack.dup(8)?,
            Opcode::Dup10 => self.stack.dup(9)?,
            Opcode::Dup11 => self.stack.dup(10)?,
            Opcode::Dup12 => self.stack.dup(11)?,
            Opcode::Dup13 => self.stack.dup(12)?,
            Opcode::Dup14 => self.stack.dup(13)?,
            Opcode::Dup15 => self.stack.dup(14)?,
            Opcode::Dup16 => self.stack.dup(15)?,

            // =================================================================
            // SWAP OPERATIONS
            // =================================================================
            Opcode::Swap1 => self.stack.swap(1)?,
            Opcode::Swap2 => self.stack.swap(2)?,
            Opcode::Swap3 => self.stack.swap(3)?,
            Opcode::Swap4 => self.stack.swap(4)?,
            Opcode::Swap5 => self.stack.swap(5)?,
            Opcode::Swap6 => self.stack.swap(6)?,
            Opcode::Swap7 => self.stack.swap(7)?,
            Opcode::Swap8 => self.stack.swap(8)?,
            Opcode::Swap9 => self.stack.swap(9)?,
            Opcode::Swap10 => self.stack.swap(10)?,
            Opcode::Swap11 => self.stack.swap(11)?,
            Opcode::Swap12 => self.stack.swap(12)?,
            Opcode::Swap13 => self.stack.swap(13)?,
            Opcode::Swap14 => self.stack.swap(14)?,
            Opcode::Swap15 => self.stack.swap(15)?,
            Opcode::Swap16 => self.stack.swap(16)?,

            // =================================================================
            // LOG OPERATIONS
            // =================================================================
            Opcode::Log0 | Opcode::Log1 | Opcode::Log2 | Opcode::Log3 | Opcode::Log4 => {
                if self.context.is_static {
                    return Err(VmError::WriteInStaticContext);
                }

                let topic_count = match opcode {
                    Opcode::Log0 => 0,
                    Opcode::Log1 => 1,
                    Opcode::Log2 => 2,
                    Opcode::Log3 => 3,
                    Opcode::Log4 => 4,
                    _ => unreachable!(),
                };

                let offset = Self::checked_usize(self.stack.pop()?)?;
                let size = Self::checked_usize(self.stack.pop()?)?;

                let mut topics = Vec::with_capacity(topic_count);
                for _ in 0..topic_count {
                    let topic = self.stack.pop()?;
                    let mut bytes = [0u8; 32];
                    topic.to_big_endian(&mut bytes);
                    topics.push(Hash::new(bytes));
                }

                // Memory expansion
                let words_added = self.memory.expand(offset + size)?;
                let mem_gas = memory_expansion_cost(
                    self.memory.word_size() - words_added,
                    self.memory.word_size(),
                );
                if !self.consume_gas(mem_gas) {
                    return Err(VmError::OutOfGas);
                }

                // Log gas
                let log_gas = gas::log_gas_cost(size, topic_count) - costs::LOG;
                if !self.consume_gas(log_gas) {
                    return Err(VmError::OutOfGas);
                }

                let data = self.memory.read_bytes(offset, size);
                self.logs.push(Log::new(
                    self.context.address,
                    topics,
                    Bytes::from_vec(data),
                ));
            }

            // =================================================================
            // SYSTEM OPERATIONS
            // =================================================================
            Opcode::Return => {
                let offset = Self::checked_usize(self.stack.pop()?)?;
                let size = Self::checked_usize(self.stack.pop()?)?;

                // Memory expansion
                let words_added = self.memory.expand(offset + size)?;
                let mem_gas = memory_expansion_cost(
                    self.memory.word_size() - words_added,
                    self.memory.word_size(),
                );
                if !self.consume_gas(mem_gas) {
                    return Err(VmError::OutOfGas);
                }

                self.return_data = Bytes::from_vec(self.memory.read_bytes(offset, size));
                self.stopped = true;
            }

            Opcode::Revert => {
                let offset = Self::checked_usize(self.stack.pop()?)?;
                let size = Self::checked_usize(self.stack.pop()?)?;

                // Memory expansion
                let words_added = self.memory.expand(offset + size)?;
                let mem_gas = memory_expansion_cost(
                    self.memory.word_size() - words_added,
                    self.memory.word_size(),
                );
                if !self.consume_gas(mem_gas) {
                    return Err(VmError::OutOfGas);
                }

                self.return_data = Bytes::from_vec(self.memory.read_bytes(offset, size));
                self.stopped = true;
                self.reverted = true;
            }

            Opcode::Invalid => {
                return Err(VmError::InvalidOpcode(0xFE));
            }

            // =================================================================
            // ACCOUNT CODE (EIP-2929 warm/cold)
            // =================================================================
            Opcode::ExtCodeSize => {
                let addr = u256_to_address(self.stack.pop()?);
                self.charge_account_access(addr)?;
                let size = self.state.get_code_size(addr).await?;
                self.stack.push(U256::from(size))?;
            }

            Opcode::ExtCodeHash => {
                let addr = u256_to_address(self.stack.pop()?);
                self.charge_account_access(addr)?;
                let hash = if self.state.is_account_dead(addr).await? {
                    U256::zero()
                } else {
                    let h = self.state.get_code_hash(addr).await?;
                    U256::from_big_endian(h.as_bytes())
                };
                self.stack.push(hash)?;
            }

            Opcode::ExtCodeCopy => {
                let addr = u256_to_address(self.stack.pop()?);
                let dest_offset = Self::checked_usize(self.stack.pop()?)?;
                let code_offset = Self::checked_usize(self.stack.pop()?)?;
                let size = Self::checked_usize(self.stack.pop()?)?;

                self.charge_account_access(addr)?;

                let words_added = self.memory.expand(dest_offset + size)?;
                let mem_gas = memory_expansion_cost(
                    self.memory.word_size() - words_added,
                    self.memory.word_size(),
                );
                if !self.consume_gas(mem_gas) {
                    return Err(VmError::OutOfGas);
                }
                let copy_gas = gas::copy_gas_cost(size);
                if !self.consume_gas(copy_gas) {
                    return Err(VmError::OutOfGas);
                }

                let code = self.state.get_code(addr).await?;
                for i in 0..size {
                    let byte = code.as_slice().get(code_offset + i).copied().unwrap_or(0);
                    self.memory.write_byte(dest_offset + i, byte)?;
                }
            }

            // =================================================================
            // TRANSIENT STORAGE (EIP-1153)
            // =================================================================
            Opcode::TLoad => {
                let key = StorageKey::from_u256(self.stack.pop()?);
                let value = self.transient.tload(&self.context.address, &key);
                self.stack.push(value.to_u256())?;
            }

            Opcode::TStore => {
                if self.context.is_static {
                    return Err(VmError::WriteInStaticContext);
                }
                let key = StorageKey::from_u256(self.stack.pop()?);
                let value = StorageValue::from_u256(self.stack.pop()?);
                self.transient.tstore(self.context.address, key, value);
            }

            // =================================================================
            // MEMORY COPY (EIP-5656)
            // =================================================================
            Opcode::MCopy => {
                let dest_offset = Self::checked_usize(self.stack.pop()?)?;
                let src_offset = Self::checked_usize(self.stack.pop()?)?;
                let size = Self::checked_usize(self.stack.pop()?)?;

                let high_mark = dest_offset.max(src_offset);
                let words_added = self.memory.expand(high_mark + size)?;
                let mem_gas = memory_expansion_cost(
                    self.memory.word_size() - words_added,
                    self.memory.word_size(),
                );
                if !self.consume_gas(mem_gas) {
                    return Err(VmError::OutOfGas);
                }
                let copy_gas = gas::copy_gas_cost(size);
                if !self.consume_gas(copy_gas) {
                    return Err(VmError::OutOfGas);
                }

                self.memory.copy(dest_offset, src_offset, size)?;
            }

            // =================================================================
            // CREATE / CREATE2
            // =================================================================
            Opcode::Create | Opcode::Create2 => {
                self.exec_create(opcode == Opcode::Create2).await?;
            }

            // =================================================================
            // CALL FAMILY
            // =================================================================
            Opcode::Call | Opcode::CallCode | Opcode::DelegateCall | Opcode::StaticCall => {
                self.exec_call(opcode).await?;
            }

            // =================================================================
            // SELFDESTRUCT
            // =================================================================
            Opcode::SelfDestruct => {
                if self.context.is_static {
                    return Err(VmError::WriteInStaticContext);
                }

                let beneficiary = u256_to_address(self.stack.pop()?);

                let is_cold = self.config.access_lists
                    && self.access_list.touch_account(beneficiary) == AccessStatus::Cold;
                if is_cold && !self.consume_gas(costs::COLD_ACCOUNT_ACCESS) {
                    return Err(VmError::OutOfGas);
                }

                let balance = self.state.get_balance(self.context.address).await?;
                if !balance.is_zero()
                    && self.config.charge_selfdestruct_for_new_account
                    && self.state.is_account_dead(beneficiary).await?
                    && !self.consume_gas(costs::SELFDESTRUCT_NEW_ACCOUNT)
                {
                    return Err(VmError::OutOfGas);
                }

                if !balance.is_zero() {
                    self.state_changes.push(StateChange::BalanceTransfer {
                        from: self.context.address,
                        to: beneficiary,
                        amount: balance,
                    });
                }
                self.state_changes.push(StateChange::ContractDestroy {
                    address: self.context.address,
                    beneficiary,
                });
                self.addresses_to_delete.push(self.context.address);

                if self.config.selfdestruct_refund {
                    self.gas_refund += costs::SELFDESTRUCT_REFUND;
                }

                self.stopped = true;
            }
        }

        Ok(())
    }
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Analyze bytecode to find valid JUMPDEST locations.
fn analyze_jump_dests(code: &[u8]) -> HashSet<usize> {
    let mut dests = HashSet::new();
    let mut i = 0;

    while i < code.len() {
        let op = code[i];
        if op == 0x5B {
            // JUMPDEST
            dests.insert(i);
        }
        // Skip PUSH data bytes
        if (0x60..=0x7F).contains(&op) {
            let size = (op - 0x5F) as usize;
            i += size;
        }
        i += 1;
    }

    dests
}

/// Convert U256 to address (take lower 20 bytes).
fn u256_to_address(value: U256) -> Address {
    let mut bytes = [0u8; 32];
    value.to_big_endian(&mut bytes);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&bytes[12..32]);
    Address::new(addr)
}

/// Signed less than comparison.
fn signed_lt(a: U256, b: U256) -> bool {
    let a_neg = a.bit(255);
    let b_neg = b.bit(255);
    match (a_neg, b_neg) {
        (true, false) => true,
        (false, true) => false,
        _ => a < b,
    }
}

/// Signed division.
fn signed_div(a: U256, b: U256) -> U256 {
    let a_neg = a.bit(255);
    let b_neg = b.bit(255);
    let a_abs = if a_neg {
        (!a).overflowing_add(U256::one()).0
    } else {
        a
    };
    let b_abs = if b_neg {
        (!b).overflowing_add(U256::one()).0
    } else {
        b
    };
    let result = a_abs / b_abs;
    if a_neg == b_neg {
        result
    } else {
        (!result).overflowing_add(U256::one()).0
    }
}

/// Signed modulo.
fn signed_mod(a: U256, b: U256) -> U256 {
    let a_neg = a.bit(255);
    let a_abs = if a_neg {
        (!a).overflowing_add(U256::one()).0
    } else {
        a
    };
    let b_abs = if b.bit(255) {
        (!b).overflowing_add(U256::one()).0
    } else {
        b
    };
    let result = a_abs % b_abs;
    if a_neg {
        (!result).overflowing_add(U256::one()).0
    } else {
        result
    }
}

/// Arithmetic shift right.
fn sar(value: U256, shift: U256) -> U256 {
    if shift >= U256::from(256) {
        if value.bit(255) {
            U256::MAX
        } else {
            U256::zero()
        }
    } else {
        let shift = shift.as_usize();
        let is_negative = value.bit(255);
        let shifted = value >> shift;
        if is_negative {
            // Fill with 1s
            let mask = U256::MAX << (256 - shift);
            shifted | mask
        } else {
            shifted
        }
    }
}

/// Exponentiation by squaring.
fn exp_by_squaring(base: U256, mut exp: U256) -> U256 {
    if exp.is_zero() {
        return U256::one();
    }

    let mut result = U256::one();
    let mut base = base;

    while !exp.is_zero() {
        if exp.bit(0) {
            result = result.overflowing_mul(base).0;
        }
        exp >>= 1;
        base = base.overflowing_mul(base).0;
    }

    result
}

/// Convert U256 to U512 for addmod/mulmod.
fn u256_to_u512(value: U256) -> primitive_types::U512 {
    let mut bytes = [0u8; 64];
    value.to_big_endian(&mut bytes[32..]);
    primitive_types::U512::from_big_endian(&bytes)
}

/// Convert U512 back to U256.
fn u512_to_u256(value: primitive_types::U512) -> U256 {
    let mut bytes = [0u8; 64];
    value.to_big_endian(&mut bytes);
    U256::from_big_endian(&bytes[32..])
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analyze_jump_dests() {
        // Code: PUSH1 0x04 JUMP JUMPDEST STOP
        let code = vec![0x60, 0x04, 0x56, 0x5B, 0x00];
        let dests = analyze_jump_dests(&code);
        assert!(dests.contains(&3)); // JUMPDEST at position 3
        assert!(!dests.contains(&0));
    }

    #[test]
    fn test_u256_to_address() {
        let value = U256::from(0x1234u64);
        let addr = u256_to_address(value);
        assert_eq!(addr.as_bytes()[19], 0x34);
        assert_eq!(addr.as_bytes()[18], 0x12);
    }

    #[test]
    fn test_exp_by_squaring() {
        assert_eq!(exp_by_squaring(U256::from(2), U256::from(0)), U256::one());
        assert_eq!(exp_by_squaring(U256::from(2), U256::from(1)), U256::from(2));
        assert_eq!(
            exp_by_squaring(U256::from(2), U256::from(10)),
            U256::from(1024)
        );
        assert_eq!(
            exp_by_squaring(U256::from(3), U256::from(3)),
            U256::from(27)
        );
    }

    #[test]
    fn test_signed_lt() {
        let neg_one = !U256::zero(); // -1 in two's complement
        let one = U256::one();

        assert!(signed_lt(neg_one, one)); // -1 < 1
        assert!(!signed_lt(one, neg_one)); // 1 > -1
        assert!(!signed_lt(one, one)); // 1 == 1
    }

    use crate::adapters::{InMemoryAccessList, InMemoryState};
    use crate::domain::entities::BlockContext;
    use crate::domain::services::compute_contract_address_create2;

    fn test_context(address: Address, gas_limit: u64) -> ExecutionContext {
        ExecutionContext::new_transaction(
            Address::new([0xAAu8; 20]),
            address,
            U256::zero(),
            Bytes::new(),
            gas_limit,
            U256::from(1u64),
            BlockContext::default(),
        )
    }

    /// Builds bytecode that writes `data` into memory byte-by-byte starting
    /// at offset 0, via repeated PUSH1/PUSH1/MSTORE8.
    fn push_bytes_into_memory(code: &mut Vec<u8>, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            code.extend_from_slice(&[0x60, *byte, 0x60, i as u8, 0x53]);
        }
    }

    #[tokio::test]
    async fn test_create2_deploys_at_derived_address() {
        let state = InMemoryState::new();
        let caller = Address::new([0xAAu8; 20]);
        state.set_balance(caller, U256::from(1_000_000u64));
        let mut access_list = InMemoryAccessList::new();
        let mut transient = TransientStorage::new();
        let config = VmConfig::default();

        // Init code: PUSH1 0x00 PUSH1 0x00 RETURN -- deploys empty runtime code.
        let init_code = vec![0x60, 0x00, 0x60, 0x00, 0xF3];
        let salt = [0x11u8; 32];

        let mut code = Vec::new();
        push_bytes_into_memory(&mut code, &init_code);
        code.push(0x7F); // PUSH32 salt
        code.extend_from_slice(&salt);
        code.extend_from_slice(&[0x60, init_code.len() as u8]); // size
        code.extend_from_slice(&[0x60, 0x00]); // offset
        code.extend_from_slice(&[0x60, 0x00]); // value
        code.push(0xF5); // CREATE2
        code.push(0x00); // STOP

        let ctx = test_context(caller, 1_000_000);
        let mut interp = Interpreter::new(
            ctx,
            &code,
            &state,
            &mut access_list,
            &mut transient,
            &config,
        );
        let result = interp.execute().await.unwrap();
        assert!(result.success, "reverted: {:?}", result.revert_reason);

        let expected = compute_contract_address_create2(caller, Hash::new(salt), &init_code);
        let created_address = result.state_changes.iter().find_map(|c| match c {
            StateChange::ContractCreate { address, .. } => Some(*address),
            _ => None,
        });
        assert_eq!(created_address, Some(expected));

        let create_tx = result
            .internal_txs
            .iter()
            .find(|tx| tx.kind == InternalTxKind::Create2)
            .expect("CREATE2 should record an internal tx");
        assert_eq!(create_tx.from, caller);
    }

    #[tokio::test]
    async fn test_create_fails_when_caller_cannot_afford_value() {
        let state = InMemoryState::new();
        let caller = Address::new([0xBBu8; 20]);
        state.set_balance(caller, U256::zero());
        let mut access_list = InMemoryAccessList::new();
        let mut transient = TransientStorage::new();
        let config = VmConfig::default();

        let init_code = vec![0x60, 0x00, 0x60, 0x00, 0xF3];
        let mut code = Vec::new();
        push_bytes_into_memory(&mut code, &init_code);
        code.extend_from_slice(&[0x60, init_code.len() as u8]); // size
        code.extend_from_slice(&[0x60, 0x00]); // offset
        code.extend_from_slice(&[0x60, 0x01]); // value = 1, caller has 0
        code.push(0xF0); // CREATE
        code.push(0x00); // STOP

        let ctx = test_context(caller, 1_000_000);
        let mut interp = Interpreter::new(
            ctx,
            &code,
            &state,
            &mut access_list,
            &mut transient,
            &config,
        );
        let result = interp.execute().await.unwrap();
        assert!(result.success);
        // CREATE pushed 0 (failure) onto the stack but execution itself didn't trap.
        assert!(result
            .state_changes
            .iter()
            .all(|c| !matches!(c, StateChange::ContractCreate { .. })));
    }

    #[tokio::test]
    async fn test_call_with_value_transfers_balance_and_grants_stipend() {
        let state = InMemoryState::new();
        let caller = Address::new([0xCCu8; 20]);
        let callee = Address::new([0xDDu8; 20]);
        state.set_balance(caller, U256::from(1_000_000u64));
        // Callee code: STOP immediately; it should still receive the 2300
        // gas stipend even though it spends none of it.
        state.set_code(callee, Bytes::from_slice(&[0x00]));
        let mut access_list = InMemoryAccessList::new();
        let mut transient = TransientStorage::new();
        let config = VmConfig::default();

        let mut code = Vec::new();
        code.extend_from_slice(&[0x60, 0x00]); // retSize
        code.extend_from_slice(&[0x60, 0x00]); // retOffset
        code.extend_from_slice(&[0x60, 0x00]); // argsSize
        code.extend_from_slice(&[0x60, 0x00]); // argsOffset
        code.extend_from_slice(&[0x60, 0x05]); // value
        code.push(0x73); // PUSH20 callee
        code.extend_from_slice(callee.as_bytes());
        code.extend_from_slice(&[0x61, 0x27, 0x10]); // PUSH2 gas = 10000
        code.push(0xF1); // CALL
        code.push(0x00); // STOP

        let ctx = test_context(caller, 1_000_000);
        let mut interp = Interpreter::new(
            ctx,
            &code,
            &state,
            &mut access_list,
            &mut transient,
            &config,
        );
        let result = interp.execute().await.unwrap();
        assert!(result.success, "reverted: {:?}", result.revert_reason);

        let transfer = result.state_changes.iter().find_map(|c| match c {
            StateChange::BalanceTransfer { from, to, amount } => Some((*from, *to, *amount)),
            _ => None,
        });
        assert_eq!(transfer, Some((caller, callee, U256::from(5u64))));

        let call_tx = result
            .internal_txs
            .iter()
            .find(|tx| tx.kind == InternalTxKind::Call)
            .expect("CALL should record an internal tx");
        assert_eq!(call_tx.to, Some(callee));
    }

    #[tokio::test]
    async fn test_staticcall_blocks_sstore_in_callee() {
        let state = InMemoryState::new();
        let caller = Address::new([0xEEu8; 20]);
        let callee = Address::new([0xEFu8; 20]);
        // Callee: PUSH1 0 PUSH1 0 SSTORE -- a write, disallowed under STATICCALL.
        state.set_code(callee, Bytes::from_slice(&[0x60, 0x00, 0x60, 0x00, 0x55]));
        let mut access_list = InMemoryAccessList::new();
        let mut transient = TransientStorage::new();
        let config = VmConfig::default();

        let mut code = Vec::new();
        code.extend_from_slice(&[0x60, 0x00]); // retSize
        code.extend_from_slice(&[0x60, 0x00]); // retOffset
        code.extend_from_slice(&[0x60, 0x00]); // argsSize
        code.extend_from_slice(&[0x60, 0x00]); // argsOffset
        code.push(0x73); // PUSH20 callee
        code.extend_from_slice(callee.as_bytes());
        code.extend_from_slice(&[0x61, 0x27, 0x10]); // PUSH2 gas = 10000
        code.push(0xFA); // STATICCALL
        code.push(0x00); // STOP

        let ctx = test_context(caller, 1_000_000);
        let mut interp = Interpreter::new(
            ctx,
            &code,
            &state,
            &mut access_list,
            &mut transient,
            &config,
        );
        let result = interp.execute().await.unwrap();
        assert!(result.success);
        assert!(result
            .state_changes
            .iter()
            .all(|c| !matches!(c, StateChange::StorageWrite { .. })));
    }

    #[tokio::test]
    async fn test_selfdestruct_journals_transfer_and_deletion() {
        let state = InMemoryState::new();
        let contract = Address::new([0x01u8; 20]);
        let beneficiary = Address::new([0x02u8; 20]);
        state.set_balance(contract, U256::from(500u64));
        let mut access_list = InMemoryAccessList::new();
        let mut transient = TransientStorage::new();
        let config = VmConfig::default(); // shanghai: selfdestruct_refund == false

        let mut code = Vec::new();
        code.push(0x73); // PUSH20 beneficiary
        code.extend_from_slice(beneficiary.as_bytes());
        code.push(0xFF); // SELFDESTRUCT

        let ctx = test_context(contract, 100_000);
        let mut interp = Interpreter::new(
            ctx,
            &code,
            &state,
            &mut access_list,
            &mut transient,
            &config,
        );
        let result = interp.execute().await.unwrap();
        assert!(result.success);
        assert_eq!(result.addresses_to_delete, vec![contract]);
        assert_eq!(result.gas_refund, 0); // EIP-3529: no refund post-London

        let transfer = result.state_changes.iter().find_map(|c| match c {
            StateChange::BalanceTransfer { from, to, amount } => Some((*from, *to, *amount)),
            _ => None,
        });
        assert_eq!(transfer, Some((contract, beneficiary, U256::from(500u64))));
        assert!(result.state_changes.iter().any(|c| matches!(
            c,
            StateChange::ContractDestroy { address, beneficiary: b }
                if *address == contract && *b == beneficiary
        )));
    }

    #[tokio::test]
    async fn test_selfdestruct_refund_pre_london() {
        let state = InMemoryState::new();
        let contract = Address::new([0x03u8; 20]);
        let beneficiary = Address::new([0x04u8; 20]);
        let mut access_list = InMemoryAccessList::new();
        let mut transient = TransientStorage::new();
        let config = VmConfig::byzantium(); // selfdestruct_refund still true pre-London

        let mut code = vec![0x73];
        code.extend_from_slice(beneficiary.as_bytes());
        code.push(0xFF);

        let ctx = test_context(contract, 100_000);
        let mut interp = Interpreter::new(
            ctx,
            &code,
            &state,
            &mut access_list,
            &mut transient,
            &config,
        );
        let result = interp.execute().await.unwrap();
        assert!(result.success);
        assert_eq!(result.gas_refund, costs::SELFDESTRUCT_REFUND);
    }

    #[tokio::test]
    async fn test_tload_tstore_round_trip() {
        let state = InMemoryState::new();
        let addr = Address::new([0x05u8; 20]);
        let mut access_list = InMemoryAccessList::new();
        let mut transient = TransientStorage::new();
        let config = VmConfig::default();

        // PUSH1 42 PUSH1 0 TSTORE ; PUSH1 0 TLOAD
        let code = vec![
            0x60, 0x2A, 0x60, 0x00, 0x5D, // TSTORE slot 0 = 42
            0x60, 0x00, 0x5C, // TLOAD slot 0
        ];

        let ctx = test_context(addr, 100_000);
        let mut interp = Interpreter::new(
            ctx,
            &code,
            &state,
            &mut access_list,
            &mut transient,
            &config,
        );
        let result = interp.execute().await.unwrap();
        assert!(result.success);
        assert_eq!(
            transient.tload(&addr, &StorageKey::from_u256(U256::zero())),
            StorageValue::from_u256(U256::from(42u64))
        );
    }

    #[tokio::test]
    async fn test_mcopy_overlapping_regions() {
        let state = InMemoryState::new();
        let addr = Address::new([0x06u8; 20]);
        let mut access_list = InMemoryAccessList::new();
        let mut transient = TransientStorage::new();
        let config = VmConfig::default();

        let mut code = Vec::new();
        push_bytes_into_memory(&mut code, &[1, 2, 3, 4, 5]);
        // MCOPY dest=2 src=0 size=5 (overlapping, dest > src)
        code.extend_from_slice(&[0x60, 0x05]); // size
        code.extend_from_slice(&[0x60, 0x00]); // src
        code.extend_from_slice(&[0x60, 0x02]); // dest
        code.push(0x5E); // MCOPY

        let ctx = test_context(addr, 100_000);
        let mut interp = Interpreter::new(
            ctx,
            &code,
            &state,
            &mut access_list,
            &mut transient,
            &config,
        );
        let result = interp.execute().await.unwrap();
        assert!(result.success);
        assert_eq!(interp.memory.read_bytes(2, 5), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_extcodesize_cold_then_warm() {
        let state = InMemoryState::new();
        let caller = Address::new([0x07u8; 20]);
        let target = Address::new([0x08u8; 20]);
        state.set_code(target, Bytes::from_slice(&[0x00, 0x00, 0x00]));
        let mut access_list = InMemoryAccessList::new();
        let mut transient = TransientStorage::new();
        let config = VmConfig::berlin(); // access_lists enabled

        let mut code = Vec::new();
        code.push(0x73); // PUSH20 target
        code.extend_from_slice(target.as_bytes());
        code.push(0x3B); // EXTCODESIZE (cold)
        code.push(0x73); // PUSH20 target
        code.extend_from_slice(target.as_bytes());
        code.push(0x3B); // EXTCODESIZE (warm)
        code.push(0x00);

        let ctx = test_context(caller, 100_000);
        let mut interp = Interpreter::new(
            ctx,
            &code,
            &state,
            &mut access_list,
            &mut transient,
            &config,
        );
        let result = interp.execute().await.unwrap();
        assert!(result.success);
        assert!(access_list.is_account_warm(target));

        // Two EXTCODESIZE calls: first cold (2600), second warm (100), plus
        // a PUSH20 (very-low) pushing the target address before each.
        let expected_gas = costs::COLD_ACCOUNT_ACCESS
            + costs::WARM_ACCOUNT_ACCESS
            + 2 * costs::VERY_LOW;
        assert_eq!(result.gas_used, expected_gas);
    }

    #[tokio::test]
    async fn test_stack_underflow_checked_before_gas() {
        // ADD needs two stack items. An empty stack must fail with
        // StackUnderflow even though the gas limit is also too low to
        // cover ADD's base cost.
        let state = InMemoryState::new();
        let mut access_list = InMemoryAccessList::new();
        let mut transient = TransientStorage::new();
        let config = VmConfig::default();
        let code = vec![0x01]; // ADD

        let ctx = test_context(Address::new([0x09u8; 20]), 0);
        let mut interp = Interpreter::new(
            ctx,
            &code,
            &state,
            &mut access_list,
            &mut transient,
            &config,
        );
        let err = interp.execute().await.unwrap_err();
        assert!(matches!(err, VmError::StackUnderflow));
    }

    #[tokio::test]
    async fn test_keccak256_huge_offset_errors_instead_of_panicking() {
        // PUSH32 0xFFFF..FF KECCAK256: the offset is far beyond any usize,
        // let alone the memory ceiling. Must surface a VmError, not panic.
        let state = InMemoryState::new();
        let mut access_list = InMemoryAccessList::new();
        let mut transient = TransientStorage::new();
        let config = VmConfig::default();

        let mut code = vec![0x60, 0x01]; // PUSH1 1 (size)
        code.push(0x7F); // PUSH32 (offset, ends up on top)
        code.extend_from_slice(&[0xFFu8; 32]);
        code.push(0x20); // KECCAK256

        let ctx = test_context(Address::new([0x0Au8; 20]), 1_000_000);
        let mut interp = Interpreter::new(
            ctx,
            &code,
            &state,
            &mut access_list,
            &mut transient,
            &config,
        );
        let err = interp.execute().await.unwrap_err();
        assert!(matches!(err, VmError::MemoryLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn test_sstore_reset_cost_for_nonzero_to_nonzero_update() {
        // Updating an already-nonzero slot to a different nonzero value
        // must charge SSTORE_RESET, not the higher SSTORE_SET.
        let state = InMemoryState::new();
        let contract = Address::new([0x0Bu8; 20]);
        state.set_storage_value(
            contract,
            StorageKey::from_u256(U256::from(1u64)),
            StorageValue::from_u256(U256::from(7u64)),
        );
        let mut access_list = InMemoryAccessList::new();
        let mut transient = TransientStorage::new();
        let config = VmConfig::berlin();

        let code = vec![
            0x60, 0x09, // PUSH1 9 (new value)
            0x60, 0x01, // PUSH1 1 (key)
            0x55, // SSTORE
            0x00, // STOP
        ];
        let ctx = test_context(contract, 1_000_000);
        let mut interp = Interpreter::new(
            ctx,
            &code,
            &state,
            &mut access_list,
            &mut transient,
            &config,
        );
        let result = interp.execute().await.unwrap();
        assert!(result.success);
        let expected_gas = costs::COLD_SLOAD + costs::SSTORE_RESET + 2 * costs::VERY_LOW;
        assert_eq!(result.gas_used, expected_gas);
        assert_eq!(result.gas_refund, 0);
    }

    #[tokio::test]
    async fn test_sstore_clear_grants_refund() {
        // Clearing an already-nonzero slot to zero must grant
        // SSTORE_CLEAR_REFUND.
        let state = InMemoryState::new();
        let contract = Address::new([0x0Cu8; 20]);
        state.set_storage_value(
            contract,
            StorageKey::from_u256(U256::from(1u64)),
            StorageValue::from_u256(U256::from(7u64)),
        );
        let mut access_list = InMemoryAccessList::new();
        let mut transient = TransientStorage::new();
        let config = VmConfig::berlin();

        let code = vec![
            0x60, 0x00, // PUSH1 0 (new value)
            0x60, 0x01, // PUSH1 1 (key)
            0x55, // SSTORE
            0x00, // STOP
        ];
        let ctx = test_context(contract, 1_000_000);
        let mut interp = Interpreter::new(
            ctx,
            &code,
            &state,
            &mut access_list,
            &mut transient,
            &config,
        );
        let result = interp.execute().await.unwrap();
        assert!(result.success);
        assert_eq!(result.gas_refund, costs::SSTORE_CLEAR_REFUND);
    }

    #[tokio::test]
    async fn test_revert_decodes_error_string_reason() {
        // REVERT with an ABI-encoded Error(string) payload must populate
        // `revert_reason` via `ExecutionResult::revert`, not leave it None.
        let state = InMemoryState::new();
        let mut access_list = InMemoryAccessList::new();
        let mut transient = TransientStorage::new();
        let config = VmConfig::default();

        // Error(string) selector 0x08c379a0 + offset(32) + len(5) + "hello" padded.
        let mut revert_data = Vec::new();
        revert_data.extend_from_slice(&[0x08, 0xc3, 0x79, 0xa0]);
        let mut offset_word = [0u8; 32];
        offset_word[31] = 0x20;
        revert_data.extend_from_slice(&offset_word);
        let mut len_word = [0u8; 32];
        len_word[31] = 5;
        revert_data.extend_from_slice(&len_word);
        let mut data_word = [0u8; 32];
        data_word[..5].copy_from_slice(b"hello");
        revert_data.extend_from_slice(&data_word);

        let mut code = Vec::new();
        push_bytes_into_memory(&mut code, &revert_data);
        code.push(0x60); // PUSH1 size
        code.push(revert_data.len() as u8);
        code.push(0x60); // PUSH1 offset
        code.push(0x00);
        code.push(0xFD); // REVERT

        let ctx = test_context(Address::new([0x0Du8; 20]), 1_000_000);
        let mut interp = Interpreter::new(
            ctx,
            &code,
            &state,
            &mut access_list,
            &mut transient,
            &config,
        );
        let result = interp.execute().await.unwrap();
        assert!(!result.success);
        assert_eq!(result.revert_reason, Some("hello".to_string()));
    }
}
