// DANS : src/rpc/resilient_client.rs

use crate::chain::{
    CallOutput, ChainClient, ChainError, ChainLog, LogFilter, LogSubscription, ReadCall,
};
use crate::monitoring::metrics;
use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Un "wrapper" autour d'un `ChainClient` qui ajoute une logique de
/// ré-essai automatique pour les appels qui échouent à cause d'erreurs
/// réseau temporaires. Les réponses définitives (revert, pas de code) sont
/// rendues immédiatement.
#[derive(Clone)]
pub struct ResilientChainClient<C> {
    inner: Arc<C>,
    max_retries: u8,
    delay_ms: u64,
}

impl<C: ChainClient> ResilientChainClient<C> {
    /// Construit un nouveau client résilient.
    pub fn new(inner: C, max_retries: u8, delay_ms: u64) -> Self {
        Self {
            inner: Arc::new(inner),
            max_retries,
            delay_ms,
        }
    }

    /// Méthode "passe-plat" pour accéder au client sous-jacent.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn with_retry<T, F, Fut>(&self, method: &'static str, mut op: F) -> Result<T, ChainError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => {
                    metrics::RPC_REQUESTS_TOTAL
                        .with_label_values(&[method, "success"])
                        .inc();
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    metrics::RPC_REQUESTS_TOTAL
                        .with_label_values(&[method, "retry"])
                        .inc();
                    debug!(method, attempt, error = %e, "[ResilientChainClient] Nouvelle tentative.");
                    sleep(Duration::from_millis(self.delay_ms)).await;
                }
                Err(e) => {
                    metrics::RPC_REQUESTS_TOTAL
                        .with_label_values(&[method, "failure"])
                        .inc();
                    if e.is_retryable() {
                        warn!(method, attempts = attempt + 1, error = %e, "[ResilientChainClient] Échec final.");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl<C: ChainClient> ChainClient for ResilientChainClient<C> {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        self.with_retry("chain_id", || self.inner.chain_id()).await
    }

    async fn latest_block(&self) -> Result<u64, ChainError> {
        self.with_retry("latest_block", || self.inner.latest_block()).await
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<ChainLog>, ChainError> {
        self.with_retry("get_logs", || self.inner.get_logs(filter)).await
    }

    async fn subscribe(&self, filter: LogFilter) -> Result<LogSubscription, ChainError> {
        self.with_retry("subscribe", || self.inner.subscribe(filter.clone()))
            .await
    }

    async fn call(&self, call: ReadCall) -> Result<CallOutput, ChainError> {
        self.with_retry(call.method(), || self.inner.call(call)).await
    }

    async fn native_balance(&self, address: Address) -> Result<U256, ChainError> {
        self.with_retry("native_balance", || self.inner.native_balance(address))
            .await
    }
}
