// DANS : src/chain/memory.rs

//! Une chaîne en mémoire : contrats simulés, logs, abonnements et pannes
//! injectables. Utilisée par les tests pour piloter la synchronisation de
//! bout en bout sans nœud.

use super::{
    CallOutput, ChainClient, ChainError, ChainLog, LogFilter, LogSubscription, ReadCall,
    abi::{IPiggyBanks, encode_bytes32_text},
};
use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};
use tokio::sync::mpsc;

/// État d'une tirelire déployée.
#[derive(Debug, Clone, Default)]
pub struct BankContract {
    pub owner: Address,
    pub name: B256,
    pub tokens: Vec<Address>,
    pub collectibles: Vec<Address>,
    pub collected: HashMap<Address, Vec<U256>>,
}

/// Un contrat ERC20 ou ERC721. `None` simule une méthode absente (revert).
#[derive(Debug, Clone, Default)]
pub struct TokenContract {
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub balances: HashMap<Address, U256>,
}

#[derive(Default)]
struct State {
    chain_id: u64,
    head: u64,
    next_tx: u64,
    logs: Vec<ChainLog>,
    subscribers: Vec<(LogFilter, mpsc::UnboundedSender<ChainLog>)>,
    banks: HashMap<Address, BankContract>,
    tokens: HashMap<Address, TokenContract>,
    balances: HashMap<Address, U256>,
    failures: HashMap<ReadCall, ChainError>,
    failing_balances: HashMap<Address, ChainError>,
}

pub struct InMemoryChain {
    state: Mutex<State>,
}

impl InMemoryChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            state: Mutex::new(State {
                chain_id,
                ..State::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_chain_id(&self, chain_id: u64) {
        self.lock().chain_id = chain_id;
    }

    pub fn head(&self) -> u64 {
        self.lock().head
    }

    // --- CONTRATS ---

    pub fn deploy_bank(&self, address: Address, owner: Address, name: &str) {
        self.lock().banks.insert(
            address,
            BankContract {
                owner,
                name: encode_bytes32_text(name),
                ..BankContract::default()
            },
        );
    }

    /// Le code disparaît : tout appel répondra `NoContract`.
    pub fn destroy_bank(&self, address: Address) {
        self.lock().banks.remove(&address);
    }

    pub fn set_owner(&self, bank: Address, owner: Address) {
        if let Some(contract) = self.lock().banks.get_mut(&bank) {
            contract.owner = owner;
        }
    }

    pub fn rename(&self, bank: Address, name: &str) {
        if let Some(contract) = self.lock().banks.get_mut(&bank) {
            contract.name = encode_bytes32_text(name);
        }
    }

    pub fn set_balance(&self, address: Address, wei: U256) {
        self.lock().balances.insert(address, wei);
    }

    pub fn deploy_token(&self, token: Address, name: Option<&str>, symbol: Option<&str>) {
        self.lock().tokens.insert(
            token,
            TokenContract {
                name: name.map(str::to_string),
                symbol: symbol.map(str::to_string),
                balances: HashMap::new(),
            },
        );
    }

    pub fn set_token_balance(&self, token: Address, holder: Address, amount: U256) {
        if let Some(contract) = self.lock().tokens.get_mut(&token) {
            contract.balances.insert(holder, amount);
        }
    }

    /// Ajoute `token` à la liste de la tirelire (le contrat du token doit
    /// être déployé séparément).
    pub fn add_bank_token(&self, bank: Address, token: Address) {
        if let Some(contract) = self.lock().banks.get_mut(&bank) {
            contract.tokens.push(token);
        }
    }

    /// Déploie la collection si besoin et l'ajoute à la tirelire avec ses ids.
    pub fn add_collectible(&self, bank: Address, collection: Address, name: Option<&str>, ids: Vec<U256>) {
        let mut state = self.lock();
        state.tokens.entry(collection).or_insert_with(|| TokenContract {
            name: name.map(str::to_string),
            symbol: None,
            balances: HashMap::new(),
        });
        if let Some(contract) = state.banks.get_mut(&bank) {
            contract.collectibles.push(collection);
            contract.collected.insert(collection, ids);
        }
    }

    // --- PANNES ---

    pub fn fail(&self, call: ReadCall, error: ChainError) {
        self.lock().failures.insert(call, error);
    }

    pub fn fail_balance(&self, address: Address, error: ChainError) {
        self.lock().failing_balances.insert(address, error);
    }

    /// Retire toutes les pannes injectées.
    pub fn heal(&self) {
        let mut state = self.lock();
        state.failures.clear();
        state.failing_balances.clear();
    }

    // --- LOGS ---

    /// Mine un bloc contenant un seul log `event` émis par `emitter`, et le
    /// pousse aux abonnés concernés.
    pub fn emit_event<E: SolEvent>(&self, emitter: Address, event: &E) -> ChainLog {
        let data = event.encode_log_data();
        let mut state = self.lock();
        state.head += 1;
        state.next_tx += 1;
        let log = ChainLog {
            address: emitter,
            topics: data.topics().to_vec(),
            data: data.data.clone(),
            block_number: state.head,
            block_hash: B256::from(U256::from(state.head)),
            transaction_hash: B256::from(U256::from(0x7000_0000u64 + state.next_tx)),
            log_index: 0,
        };
        state.logs.push(log.clone());
        state
            .subscribers
            .retain(|(filter, tx)| !filter.matches(&log) || tx.send(log.clone()).is_ok());
        log
    }

    pub fn emit_created(&self, factory: Address, bank: Address) -> ChainLog {
        self.emit_event(factory, &IPiggyBanks::Created { piggyBank: bank })
    }

    /// Mine des blocs vides.
    pub fn mine(&self, blocks: u64) {
        self.lock().head += blocks;
    }

    /// Abonnements encore ouverts sur `address`.
    pub fn subscriber_count(&self, address: Address) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|(filter, tx)| filter.address == address && !tx.is_closed())
            .count()
    }

    fn read(state: &State, call: ReadCall) -> Result<CallOutput, ChainError> {
        if let Some(error) = state.failures.get(&call) {
            return Err(error.clone());
        }
        let target = call.target();
        let bank = || state.banks.get(&target).ok_or(ChainError::NoContract(target));
        let token = || state.tokens.get(&target).ok_or(ChainError::NoContract(target));
        let reverted = |why: &str| ChainError::Reverted(format!("{}: {}", call.method(), why));

        match call {
            ReadCall::Owner(_) => Ok(CallOutput::Address(bank()?.owner)),
            ReadCall::Name(_) => Ok(CallOutput::Word(bank()?.name)),
            ReadCall::TokensCount(_) => Ok(CallOutput::Uint(U256::from(bank()?.tokens.len()))),
            ReadCall::TokenAt(_, i) => bank()?
                .tokens
                .get(i as usize)
                .map(|a| CallOutput::Address(*a))
                .ok_or_else(|| reverted("index hors limites")),
            ReadCall::CollectiblesCount(_) => {
                Ok(CallOutput::Uint(U256::from(bank()?.collectibles.len())))
            }
            ReadCall::CollectibleAt(_, i) => bank()?
                .collectibles
                .get(i as usize)
                .map(|a| CallOutput::Address(*a))
                .ok_or_else(|| reverted("index hors limites")),
            ReadCall::CollectedCount { collection, .. } => Ok(CallOutput::Uint(U256::from(
                bank()?.collected.get(&collection).map_or(0, Vec::len),
            ))),
            ReadCall::CollectedAt {
                collection, index, ..
            } => bank()?
                .collected
                .get(&collection)
                .and_then(|ids| ids.get(index as usize))
                .map(|id| CallOutput::Uint(*id))
                .ok_or_else(|| reverted("index hors limites")),
            ReadCall::TokenName(_) => token()?
                .name
                .clone()
                .map(CallOutput::Text)
                .ok_or_else(|| reverted("méthode absente")),
            ReadCall::TokenSymbol(_) => token()?
                .symbol
                .clone()
                .map(CallOutput::Text)
                .ok_or_else(|| reverted("méthode absente")),
            ReadCall::TokenBalance { holder, .. } => Ok(CallOutput::Uint(
                token()?.balances.get(&holder).copied().unwrap_or_default(),
            )),
        }
    }
}

#[async_trait]
impl ChainClient for InMemoryChain {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        Ok(self.lock().chain_id)
    }

    async fn latest_block(&self) -> Result<u64, ChainError> {
        Ok(self.lock().head)
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<ChainLog>, ChainError> {
        let state = self.lock();
        Ok(state.logs.iter().filter(|log| filter.matches(log)).cloned().collect())
    }

    /// Le rejeu des logs déjà minés (si `from_block` est dans le passé) et
    /// l'inscription se font sous le même verrou : aucun log ne peut tomber
    /// entre les deux.
    async fn subscribe(&self, filter: LogFilter) -> Result<LogSubscription, ChainError> {
        let mut state = self.lock();
        let filter = LogFilter {
            from_block: Some(filter.from_block.unwrap_or(state.head + 1)),
            ..filter
        };
        let (tx, rx) = mpsc::unbounded_channel();
        for log in state.logs.iter().filter(|log| filter.matches(log)) {
            // Le receiver est encore entre nos mains.
            let _ = tx.send(log.clone());
        }
        state.subscribers.push((filter, tx));
        Ok(LogSubscription::new(rx, None))
    }

    async fn call(&self, call: ReadCall) -> Result<CallOutput, ChainError> {
        Self::read(&self.lock(), call)
    }

    async fn native_balance(&self, address: Address) -> Result<U256, ChainError> {
        let state = self.lock();
        if let Some(error) = state.failing_balances.get(&address) {
            return Err(error.clone());
        }
        Ok(state.balances.get(&address).copied().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    const FACTORY: Address = address!("08f6e0571bcda646d11371c0dab7d9a72be6bb8e");
    const BANK: Address = address!("00000000000000000000000000000000000000aa");

    #[tokio::test]
    async fn live_subscription_sees_only_future_logs() {
        let chain = InMemoryChain::new(1);
        chain.emit_created(FACTORY, BANK);

        let mut live = chain.subscribe(LogFilter::new(FACTORY)).await.unwrap();
        let next = chain.emit_created(FACTORY, BANK);

        assert_eq!(live.next().await, Some(next));
        assert_eq!(chain.get_logs(&LogFilter::new(FACTORY)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn mined_blocks_move_the_live_starting_point() {
        let chain = InMemoryChain::new(1);
        chain.emit_created(FACTORY, BANK);
        chain.mine(5);
        assert_eq!(chain.head(), 6);
        assert_eq!(chain.latest_block().await.unwrap(), 6);

        let mut live = chain.subscribe(LogFilter::new(FACTORY)).await.unwrap();
        let next = chain.emit_created(FACTORY, BANK);
        assert_eq!(next.block_number, 7);
        assert_eq!(live.next().await, Some(next));
    }

    #[tokio::test]
    async fn dropped_subscription_is_released() {
        let chain = InMemoryChain::new(1);
        let live = chain.subscribe(LogFilter::new(BANK)).await.unwrap();
        assert_eq!(chain.subscriber_count(BANK), 1);
        drop(live);
        assert_eq!(chain.subscriber_count(BANK), 0);
    }

    #[tokio::test]
    async fn calls_on_missing_code_or_bad_index_fail() {
        let chain = InMemoryChain::new(1);
        assert_eq!(
            chain.call(ReadCall::Owner(BANK)).await,
            Err(ChainError::NoContract(BANK))
        );

        chain.deploy_bank(BANK, FACTORY, "Test");
        assert!(matches!(
            chain.call(ReadCall::TokenAt(BANK, 0)).await,
            Err(ChainError::Reverted(_))
        ));
        assert_eq!(
            chain.call(ReadCall::TokensCount(BANK)).await,
            Ok(CallOutput::Uint(U256::ZERO))
        );
    }
}
