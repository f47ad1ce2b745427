// DANS : src/chain/mod.rs

//! La capacité "chaîne" consommée par le cœur : lire des logs sur une plage de
//! blocs, s'abonner aux logs à venir, appeler une méthode de contrat en lecture.
//!
//! Le cœur ne connaît que le trait [`ChainClient`]. Deux implémentations
//! existent : [`alloy_client::AlloyChainClient`] (JSON-RPC réel) et
//! [`memory::InMemoryChain`] (chaîne en mémoire pour les tests).

use alloy::primitives::{Address, B256, Bytes, U256};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};

pub mod abi;
pub mod alloy_client;
pub mod memory;

/// Erreurs de la couche chaîne.
///
/// Seules les erreurs `Transport` sont considérées temporaires ; tout le reste
/// est une réponse définitive du nœud (revert, absence de code, etc.).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("erreur de transport RPC : {0}")]
    Transport(String),

    #[error("appel rejeté par le nœud : {0}")]
    Reverted(String),

    #[error("aucun contrat à l'adresse {0}")]
    NoContract(Address),

    #[error("échec de décodage : {0}")]
    Decode(String),

    #[error("sortie inattendue pour {method} : {found}")]
    UnexpectedOutput { method: &'static str, found: String },

    #[error("configuration invalide : {0}")]
    Config(String),
}

impl ChainError {
    /// Détermine si une nouvelle tentative a une chance de réussir.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChainError::Transport(_))
    }
}

/// Filtre de logs : un émetteur, éventuellement une signature d'événement,
/// et une plage de blocs.
///
/// Pour `get_logs`, `from_block = None` signifie la genèse. Pour `subscribe`,
/// `from_block = None` signifie "à partir du prochain bloc".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    pub topic0: Option<B256>,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
}

impl LogFilter {
    /// Tous les événements émis par `address`.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            topic0: None,
            from_block: None,
            to_block: None,
        }
    }

    pub fn event(mut self, signature: B256) -> Self {
        self.topic0 = Some(signature);
        self
    }

    pub fn from_block(mut self, block: u64) -> Self {
        self.from_block = Some(block);
        self
    }

    pub fn to_block(mut self, block: u64) -> Self {
        self.to_block = Some(block);
        self
    }

    pub fn matches(&self, log: &ChainLog) -> bool {
        if log.address != self.address {
            return false;
        }
        if let Some(topic0) = self.topic0 {
            if log.topic0() != Some(topic0) {
                return false;
            }
        }
        if let Some(from) = self.from_block {
            if log.block_number < from {
                return false;
            }
        }
        if let Some(to) = self.to_block {
            if log.block_number > to {
                return false;
            }
        }
        true
    }
}

/// Un log brut, tel que livré par le nœud, avec sa position dans la chaîne.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_hash: B256,
    pub log_index: u64,
}

impl ChainLog {
    pub fn topic0(&self) -> Option<B256> {
        self.topics.first().copied()
    }

    /// Ordre canonique de la chaîne : bloc, puis index du log.
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

/// Flux de logs en direct.
///
/// C'est une ressource à portée : quand le handle est détruit, la tâche de
/// fond qui alimente le flux (s'il y en a une) est arrêtée.
pub struct LogSubscription {
    receiver: mpsc::UnboundedReceiver<ChainLog>,
    task: Option<JoinHandle<()>>,
}

impl LogSubscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<ChainLog>, task: Option<JoinHandle<()>>) -> Self {
        Self { receiver, task }
    }

    /// Prochain log, ou `None` quand la source a fermé le flux.
    pub async fn next(&mut self) -> Option<ChainLog> {
        self.receiver.recv().await
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Une méthode de contrat en lecture seule, avec ses arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadCall {
    /// `PiggyBank.owner() -> address`
    Owner(Address),
    /// `PiggyBank.name() -> bytes32`
    Name(Address),
    /// `PiggyBank.tokensCount() -> uint256`
    TokensCount(Address),
    /// `PiggyBank.tokens(i) -> address`
    TokenAt(Address, u64),
    /// `PiggyBank.collectiblesCount() -> uint256`
    CollectiblesCount(Address),
    /// `PiggyBank.collectibles(i) -> address`
    CollectibleAt(Address, u64),
    /// `PiggyBank.collectedCount(collection) -> uint256`
    CollectedCount { bank: Address, collection: Address },
    /// `PiggyBank.collected(collection, j) -> uint256`
    CollectedAt { bank: Address, collection: Address, index: u64 },
    /// `ERC20/ERC721.name() -> string`
    TokenName(Address),
    /// `ERC20.symbol() -> string`
    TokenSymbol(Address),
    /// `ERC20.balanceOf(holder) -> uint256`
    TokenBalance { token: Address, holder: Address },
}

impl ReadCall {
    /// Nom de la méthode, utilisé comme label de métrique.
    pub fn method(&self) -> &'static str {
        match self {
            ReadCall::Owner(_) => "owner",
            ReadCall::Name(_) => "name",
            ReadCall::TokensCount(_) => "tokensCount",
            ReadCall::TokenAt(..) => "tokens",
            ReadCall::CollectiblesCount(_) => "collectiblesCount",
            ReadCall::CollectibleAt(..) => "collectibles",
            ReadCall::CollectedCount { .. } => "collectedCount",
            ReadCall::CollectedAt { .. } => "collected",
            ReadCall::TokenName(_) => "token_name",
            ReadCall::TokenSymbol(_) => "token_symbol",
            ReadCall::TokenBalance { .. } => "balanceOf",
        }
    }

    /// Le contrat appelé.
    pub fn target(&self) -> Address {
        match *self {
            ReadCall::Owner(bank)
            | ReadCall::Name(bank)
            | ReadCall::TokensCount(bank)
            | ReadCall::TokenAt(bank, _)
            | ReadCall::CollectiblesCount(bank)
            | ReadCall::CollectibleAt(bank, _)
            | ReadCall::CollectedCount { bank, .. }
            | ReadCall::CollectedAt { bank, .. } => bank,
            ReadCall::TokenName(token)
            | ReadCall::TokenSymbol(token)
            | ReadCall::TokenBalance { token, .. } => token,
        }
    }
}

/// Valeur de retour décodée d'un [`ReadCall`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutput {
    Address(Address),
    Word(B256),
    Text(String),
    Uint(U256),
}

impl CallOutput {
    pub fn into_address(self, method: &'static str) -> Result<Address, ChainError> {
        match self {
            CallOutput::Address(address) => Ok(address),
            other => Err(other.unexpected(method)),
        }
    }

    pub fn into_word(self, method: &'static str) -> Result<B256, ChainError> {
        match self {
            CallOutput::Word(word) => Ok(word),
            other => Err(other.unexpected(method)),
        }
    }

    pub fn into_text(self, method: &'static str) -> Result<String, ChainError> {
        match self {
            CallOutput::Text(text) => Ok(text),
            other => Err(other.unexpected(method)),
        }
    }

    pub fn into_uint(self, method: &'static str) -> Result<U256, ChainError> {
        match self {
            CallOutput::Uint(value) => Ok(value),
            other => Err(other.unexpected(method)),
        }
    }

    fn unexpected(self, method: &'static str) -> ChainError {
        ChainError::UnexpectedOutput {
            method,
            found: format!("{:?}", self),
        }
    }
}

/// Surface minimale d'un nœud distant. Les lectures commutent : une même
/// instance est partagée sans coordination entre tous les fetchs.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    /// Identité du réseau ; un changement invalide tout le modèle.
    async fn chain_id(&self) -> Result<u64, ChainError>;

    async fn latest_block(&self) -> Result<u64, ChainError>;

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<ChainLog>, ChainError>;

    async fn subscribe(&self, filter: LogFilter) -> Result<LogSubscription, ChainError>;

    async fn call(&self, call: ReadCall) -> Result<CallOutput, ChainError>;

    /// Solde natif, en wei.
    async fn native_balance(&self, address: Address) -> Result<U256, ChainError>;
}

#[async_trait]
impl<C: ChainClient + ?Sized> ChainClient for Arc<C> {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        (**self).chain_id().await
    }

    async fn latest_block(&self) -> Result<u64, ChainError> {
        (**self).latest_block().await
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<ChainLog>, ChainError> {
        (**self).get_logs(filter).await
    }

    async fn subscribe(&self, filter: LogFilter) -> Result<LogSubscription, ChainError> {
        (**self).subscribe(filter).await
    }

    async fn call(&self, call: ReadCall) -> Result<CallOutput, ChainError> {
        (**self).call(call).await
    }

    async fn native_balance(&self, address: Address) -> Result<U256, ChainError> {
        (**self).native_balance(address).await
    }
}
