// DANS : src/data_pipeline/registry.rs

//! Découverte des tirelires (historique + flux live de la fabrique) et
//! surveillance de l'activité de chacune.
//!
//! Invariant central : au plus un abonnement d'activité ouvert par adresse.
//! La table `watches` est la seule source de vérité ; l'adhésion est testée
//! et l'entrée insérée sous le même verrou, sans point de suspension.

use super::fetcher::EntityFetcher;
use crate::chain::{ChainClient, ChainError, LogFilter, abi::IPiggyBanks};
use crate::communication::{NoopNotifier, Notifier, received_notification};
use crate::monitoring::metrics;
use crate::state::{
    ActivityEvent, ActivityKind, ApplyOutcome, DiscoveryEvent, EntryState, LogId, ReadModel,
};
use alloy::primitives::{Address, U256};
use alloy::sol_types::SolEvent;
use anyhow::{Context, Result};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};
use tracing::{debug, info, warn};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);
const DISCOVERY_CHANNEL_CAPACITY: usize = 256;

struct EntityWatch {
    /// Toutes les découvertes de cette adresse (réutilisation d'adresse).
    keys: Vec<DiscoveryEvent>,
    task: JoinHandle<()>,
}

pub struct RegistrySync<C: ChainClient> {
    client: Arc<C>,
    fetcher: EntityFetcher<C>,
    model: Arc<ReadModel>,
    factory: Address,
    start_block: u64,
    account: Option<Address>,
    notifier: Arc<dyn Notifier>,
    unresolved_retry_limit: u32,
    unresolved_retry_delay: Duration,
    /// Premier bloc non couvert par le bootstrap.
    live_from: AtomicU64,
    watches: Mutex<HashMap<Address, EntityWatch>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: ChainClient> RegistrySync<C> {
    pub fn new(client: Arc<C>, model: Arc<ReadModel>, factory: Address) -> Self {
        Self {
            fetcher: EntityFetcher::new(client.clone()),
            client,
            model,
            factory,
            start_block: 0,
            account: None,
            notifier: Arc::new(NoopNotifier),
            unresolved_retry_limit: 0,
            unresolved_retry_delay: Duration::from_secs(5),
            live_from: AtomicU64::new(0),
            watches: Mutex::new(HashMap::new()),
            background: Mutex::new(Vec::new()),
        }
    }

    /// Le compte de l'utilisateur : reçoit les notifications `Received` de
    /// ses tirelires.
    pub fn with_account(mut self, account: Option<Address>) -> Self {
        self.account = account;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_start_block(mut self, block: u64) -> Self {
        self.start_block = block;
        self
    }

    /// Ré-essais temporisés pour une entité découverte mais pas encore
    /// matérialisable. 0 désactive (seule l'activité relance alors un fetch).
    pub fn with_unresolved_retry(mut self, limit: u32, delay: Duration) -> Self {
        self.unresolved_retry_limit = limit;
        self.unresolved_retry_delay = delay;
        self
    }

    fn watches(&self) -> MutexGuard<'_, HashMap<Address, EntityWatch>> {
        self.watches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        background.retain(|task| !task.is_finished());
        background.push(task);
    }

    /// Événements `Created` de la fabrique, à partir du bloc de départ.
    pub fn factory_filter(&self) -> LogFilter {
        LogFilter::new(self.factory)
            .event(IPiggyBanks::Created::SIGNATURE_HASH)
            .from_block(self.start_block)
    }

    // --- DÉCOUVERTE ---

    /// Tout l'historique `[start_block, latest]`, dans l'ordre de la chaîne.
    pub async fn bootstrap(&self) -> Result<Vec<DiscoveryEvent>, ChainError> {
        let latest = self.client.latest_block().await?;
        self.bootstrap_until(latest).await
    }

    pub async fn bootstrap_until(&self, latest: u64) -> Result<Vec<DiscoveryEvent>, ChainError> {
        let logs = self
            .client
            .get_logs(&self.factory_filter().to_block(latest))
            .await?;

        let mut events: Vec<DiscoveryEvent> = logs
            .iter()
            .filter_map(|log| match DiscoveryEvent::decode(log) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(tx = %log.transaction_hash, error = %e, "[RegistrySync] Log Created illisible ignoré.");
                    None
                }
            })
            .collect();
        events.sort_by_key(DiscoveryEvent::chain_position);
        let mut seen: HashSet<LogId> = HashSet::new();
        events.retain(|event| seen.insert(event.log_id));

        debug!(count = events.len(), to_block = latest, "[RegistrySync] Bootstrap lu.");
        Ok(events)
    }

    /// Relaie les nouveaux `Created` (à partir de `from_block`) vers `sender`,
    /// dans l'ordre d'arrivée. Se réabonne si le flux se ferme.
    pub async fn subscribe_live(
        &self,
        from_block: u64,
        sender: mpsc::Sender<DiscoveryEvent>,
    ) -> Result<JoinHandle<()>, ChainError> {
        let filter = self.factory_filter().from_block(from_block);
        let mut subscription = self.client.subscribe(filter.clone()).await?;
        let client = self.client.clone();

        Ok(tokio::spawn(async move {
            let mut cursor = from_block;
            loop {
                while let Some(log) = subscription.next().await {
                    cursor = cursor.max(log.block_number + 1);
                    match DiscoveryEvent::decode(&log) {
                        Ok(event) => {
                            if sender.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "[RegistrySync] Log Created illisible ignoré."),
                    }
                }

                warn!(cursor, "[RegistrySync] Flux de la fabrique fermé, réabonnement.");
                loop {
                    sleep(RESUBSCRIBE_DELAY).await;
                    if sender.is_closed() {
                        return;
                    }
                    match client.subscribe(filter.clone().from_block(cursor)).await {
                        Ok(next) => {
                            subscription = next;
                            break;
                        }
                        Err(e) => warn!(error = %e, "[RegistrySync] Réabonnement à la fabrique impossible."),
                    }
                }
            }
        }))
    }

    // --- SURVEILLANCE ---

    /// Ouvre l'abonnement d'activité de l'adresse, sauf s'il existe déjà.
    /// Retourne `true` si un abonnement a été ouvert. Une clé déjà retirée
    /// n'ouvre rien : personne ne pourrait plus fermer l'abonnement.
    pub fn watch_entity(self: &Arc<Self>, event: &DiscoveryEvent) -> bool {
        let mut watches = self.watches();
        if self.model.state_of(&event.log_id) == Some(EntryState::Removed) {
            return false;
        }
        if let Some(watch) = watches.get_mut(&event.entity) {
            if !watch.keys.iter().any(|key| key.log_id == event.log_id) {
                watch.keys.push(event.clone());
            }
            return false;
        }

        let from_block = (event.block.number + 1).max(self.live_from.load(Ordering::SeqCst));
        let task = tokio::spawn(Self::watch_loop(
            Arc::downgrade(self),
            self.client.clone(),
            event.entity,
            from_block,
        ));
        watches.insert(
            event.entity,
            EntityWatch {
                keys: vec![event.clone()],
                task,
            },
        );
        metrics::ACTIVE_WATCHES.inc();
        debug!(address = %event.entity, from_block, "[RegistrySync] Surveillance ouverte.");
        true
    }

    async fn watch_loop(registry: Weak<Self>, client: Arc<C>, address: Address, mut cursor: u64) {
        loop {
            match client.subscribe(LogFilter::new(address).from_block(cursor)).await {
                Ok(mut subscription) => {
                    while let Some(log) = subscription.next().await {
                        cursor = cursor.max(log.block_number + 1);
                        let Some(registry) = registry.upgrade() else {
                            return;
                        };
                        registry.on_activity(ActivityEvent::decode(&log));
                    }
                    debug!(%address, "[RegistrySync] Flux d'activité fermé, réabonnement.");
                }
                Err(e) => warn!(%address, error = %e, "[RegistrySync] Abonnement d'activité impossible."),
            }
            if registry.strong_count() == 0 {
                return;
            }
            sleep(RESUBSCRIBE_DELAY).await;
        }
    }

    /// Tout événement de la tirelire déclenche une resync de chacune de ses
    /// clés. `Received` notifie en plus le propriétaire.
    fn on_activity(self: &Arc<Self>, activity: ActivityEvent) {
        debug!(address = %activity.bank, kind = ?activity.kind, "[RegistrySync] Activité.");
        if let ActivityKind::Received { sender, amount } = activity.kind {
            self.notify_received(activity.bank, sender, amount);
        }
        for event in self.keys_for(&activity.bank) {
            let this = self.clone();
            self.track(tokio::spawn(async move {
                this.resync(&event).await;
            }));
        }
    }

    fn notify_received(&self, address: Address, sender: Address, amount: U256) {
        let Some(account) = self.account else {
            return;
        };
        let snapshot = self.model.snapshot();
        let Some(bank) = snapshot.iter().find(|bank| bank.address == address) else {
            return;
        };
        if bank.owner == account {
            self.notifier.notify(received_notification(bank, sender, amount));
        }
    }

    fn keys_for(&self, address: &Address) -> Vec<DiscoveryEvent> {
        self.watches()
            .get(address)
            .map(|watch| watch.keys.clone())
            .unwrap_or_default()
    }

    /// Ferme l'abonnement d'une adresse dont toutes les clés sont retirées.
    fn release_if_retired(&self, address: &Address) {
        let mut watches = self.watches();
        let Some(watch) = watches.get_mut(address) else {
            return;
        };
        watch
            .keys
            .retain(|key| self.model.state_of(&key.log_id) != Some(EntryState::Removed));
        if watch.keys.is_empty() {
            if let Some(watch) = watches.remove(address) {
                watch.task.abort();
                metrics::ACTIVE_WATCHES.dec();
                info!(%address, "[RegistrySync] Surveillance fermée (tirelire retirée).");
            }
        }
    }

    pub fn is_watching(&self, address: &Address) -> bool {
        self.watches().contains_key(address)
    }

    pub fn watched_count(&self) -> usize {
        self.watches().len()
    }

    // --- SYNCHRONISATION ---

    /// Un fetch complet, appliqué au modèle sous son numéro de séquence.
    pub async fn resync(&self, event: &DiscoveryEvent) -> ApplyOutcome {
        let Some(ticket) = self.model.begin_fetch(&event.log_id) else {
            return match self.model.state_of(&event.log_id) {
                Some(EntryState::Removed) => ApplyOutcome::Retired,
                _ => ApplyOutcome::UnknownKey,
            };
        };
        let result = self.fetcher.fetch(event.entity).await;
        let outcome = self.model.apply(ticket, result);
        if outcome == ApplyOutcome::Removed {
            self.release_if_retired(&event.entity);
        }
        outcome
    }

    /// Traite une découverte : enregistrement, surveillance, premier fetch.
    /// Idempotent (le chevauchement bootstrap/live livre parfois deux fois).
    pub fn discover(self: &Arc<Self>, event: DiscoveryEvent, source: &'static str) {
        metrics::DISCOVERIES_TOTAL.with_label_values(&[source]).inc();
        let fresh = self.model.register(event.clone());
        self.watch_entity(&event);
        if !fresh {
            return;
        }

        let this = self.clone();
        self.track(tokio::spawn(async move {
            this.materialize(event).await;
        }));
    }

    async fn materialize(&self, event: DiscoveryEvent) {
        self.resync(&event).await;
        for attempt in 1..=self.unresolved_retry_limit {
            if self.model.state_of(&event.log_id) != Some(EntryState::Unresolved) {
                return;
            }
            sleep(self.unresolved_retry_delay).await;
            if self.model.state_of(&event.log_id) != Some(EntryState::Unresolved) {
                return;
            }
            debug!(address = %event.entity, attempt, "[RegistrySync] Nouvel essai de matérialisation.");
            self.resync(&event).await;
        }
    }

    /// Démarre la synchronisation : abonnement live d'abord, puis lecture de
    /// l'historique jusqu'au même bloc, pour qu'aucune création ne tombe
    /// entre les deux. Retourne le nombre de tirelires de l'historique.
    pub async fn start(self: &Arc<Self>) -> Result<usize> {
        let latest = self
            .client
            .latest_block()
            .await
            .context("Impossible de lire le dernier bloc")?;
        self.live_from.store(latest + 1, Ordering::SeqCst);

        let (sender, mut receiver) = mpsc::channel(DISCOVERY_CHANNEL_CAPACITY);
        let live = self
            .subscribe_live(latest + 1, sender)
            .await
            .context("Impossible de s'abonner aux créations de tirelires")?;
        self.track(live);

        let history = self
            .bootstrap_until(latest)
            .await
            .with_context(|| format!("Échec du bootstrap de la fabrique {}", self.factory))?;
        let count = history.len();
        for event in history {
            self.discover(event, "bootstrap");
        }

        let registry = Arc::downgrade(self);
        self.track(tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                info!(address = %event.entity, block = event.block.number, "[RegistrySync] Nouvelle tirelire.");
                registry.discover(event, "live");
            }
        }));

        info!(factory = %self.factory, latest, count, "[RegistrySync] Synchronisation démarrée.");
        Ok(count)
    }

    /// Ferme tous les abonnements et arrête les tâches de fond. Le modèle
    /// garde ses données ; seul l'indicateur de chargement est remis à zéro.
    pub fn teardown(&self) {
        let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        for task in background.drain(..) {
            task.abort();
        }
        drop(background);

        let mut watches = self.watches();
        let closed = watches.len();
        for (_, watch) in watches.drain() {
            watch.task.abort();
        }
        metrics::ACTIVE_WATCHES.sub(closed as i64);
        drop(watches);

        // Les fetchs interrompus n'appelleront jamais `apply`.
        self.model.abandon_fetches();
        if closed > 0 {
            info!(closed, "[RegistrySync] Abonnements fermés.");
        }
    }
}

impl<C: ChainClient> Drop for RegistrySync<C> {
    fn drop(&mut self) {
        self.teardown();
    }
}
