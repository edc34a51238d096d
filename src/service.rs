//! # EVM Service
//!
//! Orchestrates the interpreter for a host: builds the per-call execution
//! context, pre-warms the access list, runs the VM, and tracks aggregate
//! statistics across calls.

use crate::adapters::{InMemoryAccessList, InMemoryState};
use crate::domain::entities::{BlockContext, ExecutionContext, ExecutionResult, VmConfig};
use crate::domain::value_objects::Bytes;
use crate::errors::VmError;
use crate::evm::transient::TransientStorage;
use crate::evm::Interpreter;
use crate::ports::inbound::{SignedTransaction, SmartContractApi};
use crate::ports::outbound::{AccessList, StateAccess};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument};

/// EVM service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// VM configuration.
    pub vm_config: VmConfig,
    /// Execution timeout in milliseconds.
    pub execution_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            vm_config: VmConfig::default(),
            execution_timeout_ms: 5000,
        }
    }
}

/// Aggregate statistics for a running service instance.
#[derive(Debug, Default, Clone)]
pub struct ServiceStats {
    /// Total transactions executed.
    pub transactions_executed: u64,
    /// Successful executions.
    pub successful_executions: u64,
    /// Failed executions (reverts, out of gas, etc.).
    pub failed_executions: u64,
    /// Total gas consumed.
    pub total_gas_used: u64,
    /// Average execution time in microseconds.
    pub avg_execution_time_us: u64,
}

/// Drives the interpreter against a state backend and tracks statistics.
pub struct SmartContractService<S: StateAccess, A: AccessList> {
    config: ServiceConfig,
    state: Arc<S>,
    access_list: Arc<RwLock<A>>,
    transient_storage: Arc<RwLock<TransientStorage>>,
    stats: Arc<RwLock<ServiceStats>>,
}

impl<S: StateAccess, A: AccessList> SmartContractService<S, A> {
    /// Create a new service over the given state and access-list backends.
    pub fn new(state: S, access_list: A, config: ServiceConfig) -> Self {
        Self {
            config,
            state: Arc::new(state),
            access_list: Arc::new(RwLock::new(access_list)),
            transient_storage: Arc::new(RwLock::new(TransientStorage::new())),
            stats: Arc::new(RwLock::new(ServiceStats::default())),
        }
    }

    /// Get current service statistics.
    pub async fn stats(&self) -> ServiceStats {
        self.stats.read().await.clone()
    }

    #[instrument(skip(self, tx, block))]
    async fn execute_transaction_internal(
        &self,
        tx: &SignedTransaction,
        block: &BlockContext,
    ) -> Result<ExecutionResult, VmError> {
        let is_creation = tx.to.is_none();

        let code = if is_creation {
            tx.data.clone()
        } else {
            let to_addr = tx.to.unwrap();
            self.state
                .get_code(to_addr)
                .await
                .map_err(VmError::StateError)?
        };

        let context = ExecutionContext {
            origin: tx.sender(),
            caller: tx.sender(),
            address: tx.to.unwrap_or_else(|| {
                crate::domain::services::compute_contract_address(tx.sender(), tx.nonce)
            }),
            value: tx.value,
            data: tx.data.clone(),
            gas_limit: tx.gas_limit,
            gas_price: tx.gas_price,
            block: block.clone(),
            depth: 0,
            is_static: false,
        };

        let start = Instant::now();
        let timeout = Duration::from_millis(self.config.execution_timeout_ms);
        let result = tokio::time::timeout(timeout, self.execute_code(&context, &code.0))
            .await
            .map_err(|_| VmError::Timeout {
                elapsed_ms: self.config.execution_timeout_ms,
                max_ms: self.config.execution_timeout_ms,
            })?;
        let elapsed_us = start.elapsed().as_micros() as u64;

        {
            let mut stats = self.stats.write().await;
            stats.transactions_executed += 1;
            match &result {
                Ok(res) if res.success => {
                    stats.successful_executions += 1;
                    stats.total_gas_used += res.gas_used;
                }
                _ => stats.failed_executions += 1,
            }
            let total = stats.transactions_executed;
            stats.avg_execution_time_us =
                (stats.avg_execution_time_us * (total - 1) + elapsed_us) / total;
        }

        self.transient_storage.write().await.clear();

        match &result {
            Ok(res) => debug!(
                success = res.success,
                gas_used = res.gas_used,
                logs = res.logs.len(),
                "transaction execution completed"
            ),
            Err(e) => error!(error = %e, "transaction execution failed"),
        }

        result
    }

    async fn execute_code(
        &self,
        context: &ExecutionContext,
        code: &[u8],
    ) -> Result<ExecutionResult, VmError> {
        {
            let mut access_list = self.access_list.write().await;
            access_list.warm_account(context.origin);
            access_list.warm_account(context.address);
            if context.caller != context.origin {
                access_list.warm_account(context.caller);
            }
        }

        let mut access_list = self.access_list.write().await;
        let mut transient = self.transient_storage.write().await;
        let mut interpreter = Interpreter::new(
            context.clone(),
            code,
            &*self.state,
            &mut *access_list,
            &mut *transient,
            &self.config.vm_config,
        );

        interpreter.execute().await
    }
}

/// Create a default service with in-memory adapters (for testing).
#[must_use]
pub fn create_test_service() -> SmartContractService<InMemoryState, InMemoryAccessList> {
    SmartContractService::new(
        InMemoryState::new(),
        InMemoryAccessList::new(),
        ServiceConfig::default(),
    )
}

#[async_trait]
impl<S: StateAccess + Send + Sync, A: AccessList + Send + Sync> SmartContractApi
    for SmartContractService<S, A>
{
    async fn execute(
        &self,
        context: ExecutionContext,
        code: &[u8],
    ) -> Result<ExecutionResult, VmError> {
        self.execute_code(&context, code).await
    }

    async fn execute_transaction(
        &self,
        tx: &SignedTransaction,
        block: &BlockContext,
    ) -> Result<ExecutionResult, VmError> {
        self.execute_transaction_internal(tx, block).await
    }

    async fn estimate_gas(&self, context: ExecutionContext, code: &[u8]) -> Result<u64, VmError> {
        let mut ctx = context;
        ctx.gas_limit = self.config.vm_config.max_gas_limit();

        let result = self.execute_code(&ctx, code).await?;

        let estimated = result.gas_used + (result.gas_used / 10);
        Ok(estimated)
    }

    async fn call(&self, context: ExecutionContext, code: &[u8]) -> Result<Bytes, VmError> {
        let mut ctx = context;
        ctx.is_static = true;

        let result = self.execute_code(&ctx, code).await?;

        if result.success {
            Ok(result.output)
        } else {
            Err(VmError::Revert(
                result
                    .revert_reason
                    .unwrap_or_else(|| "execution reverted".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::BlockContext;
    use crate::domain::value_objects::{Address, Bytes, Hash, U256};

    fn create_test_tx() -> SignedTransaction {
        SignedTransaction {
            from: Address::ZERO,
            to: None,
            value: U256::zero(),
            nonce: 0,
            gas_price: U256::from(1_000_000_000u64),
            gas_limit: 21000,
            data: Bytes::new(),
            hash: Hash::ZERO,
        }
    }

    #[tokio::test]
    async fn test_create_service() {
        let service = create_test_service();
        let stats = service.stats().await;
        assert_eq!(stats.transactions_executed, 0);
    }

    #[tokio::test]
    async fn test_execute_transaction_tracks_stats() {
        let service = create_test_service();
        let tx = create_test_tx();
        let block = BlockContext::default();

        let _ = service.execute_transaction(&tx, &block).await;

        let stats = service.stats().await;
        assert_eq!(stats.transactions_executed, 1);
    }

    #[tokio::test]
    async fn test_call_is_static() {
        let service = create_test_service();
        // PUSH1 0x00 PUSH1 0x00 SSTORE -- should fail under a static call.
        let code = [0x60, 0x00, 0x60, 0x00, 0x55];
        let context = ExecutionContext::new_transaction(
            Address::ZERO,
            Address::new([1u8; 20]),
            U256::zero(),
            Bytes::new(),
            100_000,
            U256::from(1u64),
            BlockContext::default(),
        );

        let result = service.call(context, &code).await;
        assert!(result.is_err());
    }
}
