// DANS : src/data_pipeline/network.rs

//! Suivi du réseau courant. Au changement de chain id, la synchronisation en
//! place est démontée et le modèle vidé avant d'en démarrer une nouvelle.

use super::registry::RegistrySync;
use crate::chain::ChainClient;
use crate::state::ReadModel;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// Issue d'une vérification du réseau.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkCheck {
    /// Même réseau que la synchronisation en place.
    Unchanged,
    /// Synchronisation (re)démarrée ; `banks` tirelires dans l'historique.
    Started { chain_id: u64, banks: usize },
    /// Aucune fabrique pour ce réseau : le modèle reste vide.
    Unsupported { chain_id: u64 },
}

pub struct NetworkSupervisor<C: ChainClient> {
    client: Arc<C>,
    model: Arc<ReadModel>,
    synced_chain: Option<u64>,
    sync: Option<Arc<RegistrySync<C>>>,
}

impl<C: ChainClient> NetworkSupervisor<C> {
    pub fn new(client: Arc<C>, model: Arc<ReadModel>) -> Self {
        Self {
            client,
            model,
            synced_chain: None,
            sync: None,
        }
    }

    /// Le réseau de la synchronisation en place (ou reconnu non supporté).
    pub fn synced_chain(&self) -> Option<u64> {
        self.synced_chain
    }

    pub fn current(&self) -> Option<&Arc<RegistrySync<C>>> {
        self.sync.as_ref()
    }

    /// Compare le chain id au réseau synchronisé et reconstruit si besoin.
    /// `build` prépare la synchronisation d'un réseau (`None` : non supporté).
    ///
    /// Sur erreur, aucun réseau n'est retenu : la vérification suivante
    /// recommence depuis zéro, même si le nœud revient au réseau précédent.
    pub async fn check<F>(&mut self, build: F) -> Result<NetworkCheck>
    where
        F: FnOnce(u64) -> Result<Option<RegistrySync<C>>>,
    {
        let current = self
            .client
            .chain_id()
            .await
            .context("Lecture du chain id impossible")?;
        if self.synced_chain == Some(current) {
            return Ok(NetworkCheck::Unchanged);
        }

        if let Some(previous) = self.sync.take() {
            info!(from = ?self.synced_chain, to = current, "[Network] Changement de réseau, reconstruction du modèle.");
            previous.teardown();
        }
        self.synced_chain = None;
        self.model.clear();

        let Some(registry) = build(current)? else {
            self.synced_chain = Some(current);
            return Ok(NetworkCheck::Unsupported { chain_id: current });
        };
        let registry = Arc::new(registry);
        let banks = registry
            .start()
            .await
            .with_context(|| format!("Échec du démarrage sur le réseau {}", current))?;

        self.sync = Some(registry);
        self.synced_chain = Some(current);
        Ok(NetworkCheck::Started {
            chain_id: current,
            banks,
        })
    }

    pub fn shutdown(&mut self) {
        if let Some(sync) = self.sync.take() {
            sync.teardown();
        }
        self.synced_chain = None;
    }
}
