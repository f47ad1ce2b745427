// DANS : src/chain/alloy_client.rs

use super::{
    CallOutput, ChainClient, ChainError, ChainLog, LogFilter, LogSubscription, ReadCall,
    abi::{IPiggyBank, IToken},
};
use alloy::{
    primitives::{Address, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::{Filter, Log},
    transports::{RpcError, TransportErrorKind, http::reqwest::Url},
};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Client JSON-RPC réel, basé sur un provider HTTP alloy.
///
/// Les abonnements sont implémentés par interrogation périodique
/// (`eth_blockNumber` puis `eth_getLogs` sur les nouveaux blocs), ce qui
/// fonctionne avec n'importe quel endpoint HTTP.
#[derive(Clone)]
pub struct AlloyChainClient {
    provider: DynProvider,
    poll_interval: Duration,
}

impl AlloyChainClient {
    pub fn connect_http(rpc_url: &str, poll_interval: Duration) -> Result<Self, ChainError> {
        let url: Url = rpc_url
            .parse()
            .map_err(|e| ChainError::Config(format!("URL RPC invalide '{}': {}", rpc_url, e)))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        Ok(Self {
            provider,
            poll_interval,
        })
    }

    async fn read(&self, call: ReadCall) -> Result<CallOutput, alloy::contract::Error> {
        let output = match call {
            ReadCall::Owner(bank) => CallOutput::Address(self.bank(bank).owner().call().await?),
            ReadCall::Name(bank) => CallOutput::Word(self.bank(bank).name().call().await?),
            ReadCall::TokensCount(bank) => {
                CallOutput::Uint(self.bank(bank).tokensCount().call().await?)
            }
            ReadCall::TokenAt(bank, index) => CallOutput::Address(
                self.bank(bank).tokens(U256::from(index)).call().await?,
            ),
            ReadCall::CollectiblesCount(bank) => {
                CallOutput::Uint(self.bank(bank).collectiblesCount().call().await?)
            }
            ReadCall::CollectibleAt(bank, index) => CallOutput::Address(
                self.bank(bank).collectibles(U256::from(index)).call().await?,
            ),
            ReadCall::CollectedCount { bank, collection } => CallOutput::Uint(
                self.bank(bank).collectedCount(collection).call().await?,
            ),
            ReadCall::CollectedAt {
                bank,
                collection,
                index,
            } => CallOutput::Uint(
                self.bank(bank)
                    .collected(collection, U256::from(index))
                    .call()
                    .await?,
            ),
            ReadCall::TokenName(token) => CallOutput::Text(self.token(token).name().call().await?),
            ReadCall::TokenSymbol(token) => {
                CallOutput::Text(self.token(token).symbol().call().await?)
            }
            ReadCall::TokenBalance { token, holder } => {
                CallOutput::Uint(self.token(token).balanceOf(holder).call().await?)
            }
        };
        Ok(output)
    }

    fn bank(&self, address: Address) -> IPiggyBank::IPiggyBankInstance<DynProvider> {
        IPiggyBank::new(address, self.provider.clone())
    }

    fn token(&self, address: Address) -> IToken::ITokenInstance<DynProvider> {
        IToken::new(address, self.provider.clone())
    }
}

/// Un nœud qui répond par un objet `error` a pris une décision définitive ;
/// tout le reste (HTTP, timeout, réponse illisible) est du transport.
fn classify(error: RpcError<TransportErrorKind>) -> ChainError {
    match error.as_error_resp() {
        Some(payload) => ChainError::Reverted(payload.message.to_string()),
        None => ChainError::Transport(error.to_string()),
    }
}

fn classify_call(call: &ReadCall, error: alloy::contract::Error) -> ChainError {
    match error {
        alloy::contract::Error::TransportError(e) => classify(e),
        alloy::contract::Error::ZeroData(..) => ChainError::NoContract(call.target()),
        other => ChainError::Decode(format!("{}: {}", call.method(), other)),
    }
}

fn to_filter(filter: &LogFilter) -> Filter {
    let mut out = Filter::new()
        .address(filter.address)
        .from_block(filter.from_block.unwrap_or(0));
    if let Some(to) = filter.to_block {
        out = out.to_block(to);
    }
    if let Some(topic0) = filter.topic0 {
        out = out.event_signature(topic0);
    }
    out
}

/// Les logs "pending" (sans position) sont ignorés : ils n'ont pas d'identité stable.
fn to_chain_log(log: Log) -> Option<ChainLog> {
    Some(ChainLog {
        address: log.inner.address,
        topics: log.inner.data.topics().to_vec(),
        data: log.inner.data.data.clone(),
        block_number: log.block_number?,
        block_hash: log.block_hash.unwrap_or_default(),
        transaction_hash: log.transaction_hash?,
        log_index: log.log_index?,
    })
}

#[async_trait]
impl ChainClient for AlloyChainClient {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        self.provider.get_chain_id().await.map_err(classify)
    }

    async fn latest_block(&self) -> Result<u64, ChainError> {
        self.provider.get_block_number().await.map_err(classify)
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<ChainLog>, ChainError> {
        let logs = self
            .provider
            .get_logs(&to_filter(filter))
            .await
            .map_err(classify)?;
        let mut logs: Vec<ChainLog> = logs.into_iter().filter_map(to_chain_log).collect();
        logs.sort_by_key(ChainLog::position);
        Ok(logs)
    }

    async fn subscribe(&self, filter: LogFilter) -> Result<LogSubscription, ChainError> {
        let mut cursor = match filter.from_block {
            Some(block) => block,
            None => self.latest_block().await? + 1,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.poll_interval);
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                let latest = match client.latest_block().await {
                    Ok(latest) => latest,
                    Err(e) => {
                        // Le flux se ferme : c'est à l'abonné de se réabonner.
                        warn!(address = %filter.address, error = %e, "[AlloyChainClient] Échec du polling, fermeture du flux.");
                        break;
                    }
                };
                if latest < cursor {
                    continue;
                }
                let range = LogFilter {
                    from_block: Some(cursor),
                    to_block: Some(latest),
                    ..filter.clone()
                };
                let logs = match client.get_logs(&range).await {
                    Ok(logs) => logs,
                    Err(e) => {
                        warn!(address = %filter.address, error = %e, "[AlloyChainClient] Échec de get_logs, fermeture du flux.");
                        break;
                    }
                };
                debug!(address = %filter.address, from = cursor, to = latest, count = logs.len(), "[AlloyChainClient] Blocs interrogés.");
                for log in logs {
                    if tx.send(log).is_err() {
                        return;
                    }
                }
                cursor = latest + 1;
            }
        });

        Ok(LogSubscription::new(rx, Some(task)))
    }

    async fn call(&self, call: ReadCall) -> Result<CallOutput, ChainError> {
        self.read(call).await.map_err(|e| classify_call(&call, e))
    }

    async fn native_balance(&self, address: Address) -> Result<U256, ChainError> {
        self.provider.get_balance(address).await.map_err(classify)
    }
}
