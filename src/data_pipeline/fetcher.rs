// DANS : src/data_pipeline/fetcher.rs

use crate::chain::{ChainClient, ChainError, ReadCall, abi::decode_bytes32_text};
use crate::monitoring::metrics;
use crate::state::{Bank, Collectible, Token};
use alloy::primitives::{Address, B256, U256};
use chrono::Utc;
use futures::future::{join_all, try_join_all};
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, warn};

/// Plafond d'énumération par liste (tokens, collections, ids par collection).
/// Un compteur aberrant renvoyé par un contrat ne doit pas lancer des
/// millions d'appels.
pub const MAX_ENUMERATED_ITEMS: u64 = 1024;

/// Produit un `Bank` complet à partir d'une adresse, en lecture seule.
/// Aucun ré-essai ici : la politique de ré-essai appartient à l'appelant.
pub struct EntityFetcher<C> {
    client: Arc<C>,
}

impl<C: ChainClient> EntityFetcher<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    /// `None` si owner, name ou le solde natif échouent : l'entité est
    /// présumée inexistante (libérée, ou pas encore déployée).
    pub async fn fetch(&self, address: Address) -> Option<Bank> {
        let core = tokio::try_join!(
            self.address(ReadCall::Owner(address)),
            self.word(ReadCall::Name(address)),
            self.client.native_balance(address),
        );
        let (owner, name, native_balance) = match core {
            Ok(core) => core,
            Err(e) => {
                debug!(%address, error = %e, "[EntityFetcher] Entité non matérialisable.");
                metrics::FETCHES_TOTAL.with_label_values(&["absent"]).inc();
                return None;
            }
        };

        let (tokens, collectibles) = tokio::join!(self.tokens(address), self.collectibles(address));

        metrics::FETCHES_TOTAL.with_label_values(&["materialized"]).inc();
        Some(Bank {
            address,
            display_name: decode_bytes32_text(name),
            owner,
            native_balance,
            tokens,
            collectibles,
            last_synced_at: Utc::now(),
        })
    }

    async fn tokens(&self, bank: Address) -> Vec<Token> {
        let count = match self.count(ReadCall::TokensCount(bank)).await {
            Ok(count) => count,
            Err(e) => {
                debug!(%bank, error = %e, "[EntityFetcher] tokensCount indisponible, liste vide.");
                return vec![];
            }
        };

        let results = join_all((0..count).map(|i| self.token(bank, i))).await;
        let mut seen = HashSet::new();
        results
            .into_iter()
            .enumerate()
            .filter_map(|(i, result)| match result {
                Ok(token) => Some(token),
                Err(e) => {
                    debug!(%bank, index = i, error = %e, "[EntityFetcher] Token ignoré.");
                    None
                }
            })
            .filter(|token| seen.insert(token.contract))
            .collect()
    }

    async fn token(&self, bank: Address, index: u64) -> Result<Token, ChainError> {
        let contract = self.address(ReadCall::TokenAt(bank, index)).await?;
        let (name, symbol, balance) = tokio::try_join!(
            self.text(ReadCall::TokenName(contract)),
            self.text(ReadCall::TokenSymbol(contract)),
            self.uint(ReadCall::TokenBalance {
                token: contract,
                holder: bank,
            }),
        )?;
        Ok(Token {
            contract,
            name,
            symbol,
            balance,
        })
    }

    async fn collectibles(&self, bank: Address) -> Vec<Collectible> {
        let count = match self.count(ReadCall::CollectiblesCount(bank)).await {
            Ok(count) => count,
            Err(e) => {
                debug!(%bank, error = %e, "[EntityFetcher] collectiblesCount indisponible, liste vide.");
                return vec![];
            }
        };

        let results = join_all((0..count).map(|i| self.collectible(bank, i))).await;
        let mut seen = HashSet::new();
        results
            .into_iter()
            .enumerate()
            .filter_map(|(i, result)| match result {
                Ok(group) => Some(group),
                Err(e) => {
                    debug!(%bank, index = i, error = %e, "[EntityFetcher] Collection ignorée.");
                    None
                }
            })
            .filter(|group| seen.insert(group.contract))
            .collect()
    }

    async fn collectible(&self, bank: Address, index: u64) -> Result<Collectible, ChainError> {
        let collection = self.address(ReadCall::CollectibleAt(bank, index)).await?;
        let (name, held_token_ids) = tokio::join!(
            self.text(ReadCall::TokenName(collection)),
            self.held_ids(bank, collection),
        );
        Ok(Collectible {
            contract: collection,
            // `name()` est optionnel en ERC721.
            name: name.ok(),
            held_token_ids: held_token_ids?,
        })
    }

    async fn held_ids(&self, bank: Address, collection: Address) -> Result<Vec<U256>, ChainError> {
        let count = self
            .count(ReadCall::CollectedCount { bank, collection })
            .await?;
        try_join_all((0..count).map(|index| {
            self.uint(ReadCall::CollectedAt {
                bank,
                collection,
                index,
            })
        }))
        .await
    }

    // --- APPELS TYPÉS ---

    async fn count(&self, call: ReadCall) -> Result<u64, ChainError> {
        let raw = self.uint(call).await?;
        let count = raw.saturating_to::<u64>();
        if count > MAX_ENUMERATED_ITEMS {
            warn!(
                contract = %call.target(),
                method = call.method(),
                count = %raw,
                "[EntityFetcher] Compteur tronqué à {}.",
                MAX_ENUMERATED_ITEMS
            );
        }
        Ok(count.min(MAX_ENUMERATED_ITEMS))
    }

    async fn address(&self, call: ReadCall) -> Result<Address, ChainError> {
        self.client.call(call).await?.into_address(call.method())
    }

    async fn word(&self, call: ReadCall) -> Result<B256, ChainError> {
        self.client.call(call).await?.into_word(call.method())
    }

    async fn text(&self, call: ReadCall) -> Result<String, ChainError> {
        self.client.call(call).await?.into_text(call.method())
    }

    async fn uint(&self, call: ReadCall) -> Result<U256, ChainError> {
        self.client.call(call).await?.into_uint(call.method())
    }
}
