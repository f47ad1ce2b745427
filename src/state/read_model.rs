// DANS : src/state/read_model.rs

//! Le modèle de lecture : l'ensemble autoritaire, dédupliqué, des tirelires
//! matérialisées, clé par événement de découverte.
//!
//! Les écritures sont sérialisées par un mutex dont la section critique ne
//! suspend jamais. Le snapshot publié vit dans un `ArcSwap` : les lecteurs
//! (UI, export, filtres) ne prennent aucun verrou.
//!
//! Course entre fetchs : chaque fetch reçoit un numéro de séquence par clé au
//! démarrage (`begin_fetch`). À la fin, `apply` n'accepte le résultat que si
//! son numéro dépasse le plus grand déjà appliqué pour cette clé.

use super::filter::SnapshotFilter;
use super::model::{Bank, DiscoveryEvent, LogId};
use crate::monitoring::metrics;
use alloy::primitives::Address;
use arc_swap::ArcSwap;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::broadcast;
use tracing::{debug, info};

const CHANGE_FEED_CAPACITY: usize = 256;

/// Jeton d'un fetch en cours : la clé et son numéro de séquence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    pub key: LogId,
    pub seq: u64,
}

impl FetchTicket {
    pub fn new(key: LogId, seq: u64) -> Self {
        Self { key, seq }
    }
}

/// État d'une clé. `Removed` est terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Unresolved,
    Materialized,
    Removed,
}

/// Résultat d'un `apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Première matérialisation de la clé.
    Materialized,
    /// Remplacement en bloc d'une tirelire déjà connue.
    Updated,
    /// La clé passe à `Removed`.
    Removed,
    /// Résultat accepté mais identique à l'état courant (ou absent sur une
    /// clé jamais matérialisée).
    Unchanged,
    /// Un fetch démarré plus tard a déjà été appliqué.
    Stale,
    /// La clé est déjà `Removed`.
    Retired,
    /// Clé inconnue (modèle vidé entre-temps, par exemple).
    UnknownKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Materialized,
    Updated,
    Removed,
}

/// Notification publiée une fois par changement effectif.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChange {
    pub key: LogId,
    pub address: Address,
    pub kind: ChangeKind,
}

enum SlotState {
    Unresolved,
    Materialized(Bank),
    Removed,
}

struct Slot {
    event: DiscoveryEvent,
    state: SlotState,
    next_seq: u64,
    applied_seq: u64,
    in_flight: BTreeSet<u64>,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<LogId, Slot>,
}

impl Inner {
    /// Ordre inverse de découverte, une seule entrée par adresse (la plus
    /// récemment découverte gagne).
    fn materialized_snapshot(&self) -> Vec<Bank> {
        let mut entries: Vec<(&DiscoveryEvent, &Bank)> = self
            .slots
            .values()
            .filter_map(|slot| match &slot.state {
                SlotState::Materialized(bank) => Some((&slot.event, bank)),
                _ => None,
            })
            .collect();
        entries.sort_by(|a, b| b.0.chain_position().cmp(&a.0.chain_position()));

        let mut seen = HashSet::new();
        entries
            .into_iter()
            .filter(|(_, bank)| seen.insert(bank.address))
            .map(|(_, bank)| bank.clone())
            .collect()
    }
}

pub struct ReadModel {
    inner: Mutex<Inner>,
    published: ArcSwap<Vec<Bank>>,
    changes: broadcast::Sender<ModelChange>,
}

impl Default for ReadModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadModel {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            published: ArcSwap::from_pointee(Vec::new()),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enregistre une clé (état `Unresolved`). Idempotent : retourne `false`
    /// si l'événement était déjà connu.
    pub fn register(&self, event: DiscoveryEvent) -> bool {
        let mut inner = self.lock();
        if inner.slots.contains_key(&event.log_id) {
            return false;
        }
        inner.slots.insert(
            event.log_id,
            Slot {
                event,
                state: SlotState::Unresolved,
                next_seq: 0,
                applied_seq: 0,
                in_flight: BTreeSet::new(),
            },
        );
        true
    }

    /// Réserve le prochain numéro de séquence pour un fetch de `key`.
    /// `None` si la clé est inconnue ou déjà retirée.
    pub fn begin_fetch(&self, key: &LogId) -> Option<FetchTicket> {
        let mut inner = self.lock();
        let slot = inner.slots.get_mut(key)?;
        if matches!(slot.state, SlotState::Removed) {
            return None;
        }
        slot.next_seq += 1;
        slot.in_flight.insert(slot.next_seq);
        Some(FetchTicket::new(*key, slot.next_seq))
    }

    /// Applique le résultat d'un fetch. `None` signifie "aucun contrat
    /// matérialisable" : retrait si la clé était matérialisée, sinon rien.
    pub fn apply(&self, ticket: FetchTicket, result: Option<Bank>) -> ApplyOutcome {
        let mut inner = self.lock();
        let Some(slot) = inner.slots.get_mut(&ticket.key) else {
            return ApplyOutcome::UnknownKey;
        };
        slot.in_flight.remove(&ticket.seq);

        if matches!(slot.state, SlotState::Removed) {
            return ApplyOutcome::Retired;
        }
        if ticket.seq <= slot.applied_seq {
            metrics::STALE_RESULTS.inc();
            debug!(
                key = ?ticket.key,
                seq = ticket.seq,
                applied = slot.applied_seq,
                "[ReadModel] Résultat périmé ignoré."
            );
            return ApplyOutcome::Stale;
        }
        slot.applied_seq = ticket.seq;

        let address = slot.event.entity;
        let (outcome, next_state) = match (&slot.state, result) {
            (SlotState::Unresolved, None) => (ApplyOutcome::Unchanged, None),
            (SlotState::Unresolved, Some(bank)) => {
                (ApplyOutcome::Materialized, Some(SlotState::Materialized(bank)))
            }
            (SlotState::Materialized(current), Some(bank)) if *current == bank => {
                (ApplyOutcome::Unchanged, None)
            }
            (SlotState::Materialized(_), Some(bank)) => {
                (ApplyOutcome::Updated, Some(SlotState::Materialized(bank)))
            }
            (SlotState::Materialized(_), None) => (ApplyOutcome::Removed, Some(SlotState::Removed)),
            (SlotState::Removed, _) => (ApplyOutcome::Retired, None),
        };

        if let Some(state) = next_state {
            slot.state = state;
            if matches!(slot.state, SlotState::Removed) {
                slot.in_flight.clear();
            }
        }

        let kind = match outcome {
            ApplyOutcome::Materialized => ChangeKind::Materialized,
            ApplyOutcome::Updated => ChangeKind::Updated,
            ApplyOutcome::Removed => ChangeKind::Removed,
            _ => return outcome,
        };

        self.publish(&inner);
        drop(inner);

        match kind {
            ChangeKind::Removed => info!(%address, "[ReadModel] Tirelire retirée."),
            _ => debug!(%address, ?kind, "[ReadModel] Tirelire synchronisée."),
        }
        // Aucun abonné n'est une situation normale.
        let _ = self.changes.send(ModelChange {
            key: ticket.key,
            address,
            kind,
        });
        outcome
    }

    fn publish(&self, inner: &Inner) {
        let snapshot = inner.materialized_snapshot();
        metrics::BANKS_MATERIALIZED.set(snapshot.len() as i64);
        self.published.store(Arc::new(snapshot));
    }

    /// Toutes les tirelires matérialisées, de la plus récemment découverte à
    /// la plus ancienne, une seule par adresse.
    pub fn snapshot(&self) -> Arc<Vec<Bank>> {
        self.published.load_full()
    }

    /// Vue dérivée, recalculée à la demande. Ne modifie rien.
    pub fn snapshot_filtered(&self, filter: &SnapshotFilter) -> Vec<Bank> {
        filter.apply(&self.snapshot())
    }

    /// Flux de changements. Se désabonner = détruire le receiver. Un abonné
    /// en retard (`Lagged`) doit simplement relire `snapshot()`.
    pub fn subscribe(&self) -> broadcast::Receiver<ModelChange> {
        self.changes.subscribe()
    }

    pub fn state_of(&self, key: &LogId) -> Option<EntryState> {
        self.lock().slots.get(key).map(|slot| match slot.state {
            SlotState::Unresolved => EntryState::Unresolved,
            SlotState::Materialized(_) => EntryState::Materialized,
            SlotState::Removed => EntryState::Removed,
        })
    }

    /// La dernière tirelire matérialisée sous `key`.
    pub fn bank(&self, key: &LogId) -> Option<Bank> {
        self.lock().slots.get(key).and_then(|slot| match &slot.state {
            SlotState::Materialized(bank) => Some(bank.clone()),
            _ => None,
        })
    }

    /// Indicateur "chargement en cours" pour l'UI. Hors des données.
    /// Chaque `begin_fetch` doit être suivi d'un `apply` ou d'un
    /// `abandon_fetches`, sinon l'adresse reste "en chargement".
    pub fn is_loading(&self, address: &Address) -> bool {
        self.lock()
            .slots
            .values()
            .any(|slot| slot.event.entity == *address && !slot.in_flight.is_empty())
    }

    /// Oublie les fetchs en cours (tâches arrêtées avant leur `apply`). Un
    /// résultat tardif reste accepté ou rejeté selon son numéro.
    pub fn abandon_fetches(&self) {
        let mut inner = self.lock();
        for slot in inner.slots.values_mut() {
            slot.in_flight.clear();
        }
    }

    /// Nombre de clés connues, tous états confondus.
    pub fn key_count(&self) -> usize {
        self.lock().slots.len()
    }

    /// Invalide tout (changement de réseau). Publie un retrait par tirelire
    /// visible pour que les abonnés se rafraîchissent.
    pub fn clear(&self) {
        let mut inner = self.lock();
        let visible: Vec<(LogId, Address)> = inner
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot.state, SlotState::Materialized(_)))
            .map(|(key, slot)| (*key, slot.event.entity))
            .collect();
        inner.slots.clear();
        self.publish(&inner);
        drop(inner);

        info!(removed = visible.len(), "[ReadModel] Modèle vidé.");
        for (key, address) in visible {
            let _ = self.changes.send(ModelChange {
                key,
                address,
                kind: ChangeKind::Removed,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::model::BlockPointer;
    use alloy::primitives::{B256, U256, address};
    use chrono::{TimeZone, Utc};

    const AA: Address = address!("00000000000000000000000000000000000000aa");
    const BB: Address = address!("00000000000000000000000000000000000000bb");
    const CC: Address = address!("00000000000000000000000000000000000000cc");

    fn discovery(entity: Address, block: u64) -> DiscoveryEvent {
        DiscoveryEvent {
            entity,
            block: BlockPointer {
                number: block,
                hash: B256::with_last_byte(block as u8),
            },
            log_id: LogId {
                transaction_hash: B256::with_last_byte(block as u8),
                log_index: 0,
            },
        }
    }

    fn bank(address: Address, name: &str, wei: u64) -> Bank {
        Bank {
            address,
            display_name: name.to_string(),
            owner: CC,
            native_balance: U256::from(wei),
            tokens: vec![],
            collectibles: vec![],
            last_synced_at: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
        }
    }

    fn addresses(model: &ReadModel) -> Vec<Address> {
        model.snapshot().iter().map(|b| b.address).collect()
    }

    #[test]
    fn snapshot_is_in_reverse_discovery_order() {
        let model = ReadModel::new();
        let d1 = discovery(AA, 1);
        let d2 = discovery(BB, 2);
        model.register(d1.clone());
        model.register(d2.clone());

        let t1 = model.begin_fetch(&d1.log_id).unwrap();
        let t2 = model.begin_fetch(&d2.log_id).unwrap();
        // Ordre de complétion inverse de l'ordre de découverte.
        assert_eq!(model.apply(t2, Some(bank(BB, "b", 2))), ApplyOutcome::Materialized);
        assert_eq!(model.apply(t1, Some(bank(AA, "a", 1))), ApplyOutcome::Materialized);

        assert_eq!(addresses(&model), vec![BB, AA]);
    }

    #[test]
    fn register_is_idempotent_per_log_identity() {
        let model = ReadModel::new();
        assert!(model.register(discovery(AA, 1)));
        assert!(!model.register(discovery(AA, 1)));
        assert_eq!(model.key_count(), 1);
    }

    #[test]
    fn same_address_under_two_keys_appears_once() {
        let model = ReadModel::new();
        let old = discovery(AA, 1);
        let new = discovery(AA, 5);
        model.register(old.clone());
        model.register(new.clone());

        let t_old = model.begin_fetch(&old.log_id).unwrap();
        model.apply(t_old, Some(bank(AA, "ancienne", 1)));
        let t_new = model.begin_fetch(&new.log_id).unwrap();
        model.apply(t_new, Some(bank(AA, "nouvelle", 2)));

        let snapshot = model.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].display_name, "nouvelle");
    }

    #[test]
    fn applying_the_same_result_twice_is_a_no_op() {
        let model = ReadModel::new();
        let d1 = discovery(AA, 1);
        model.register(d1.clone());
        let ticket = model.begin_fetch(&d1.log_id).unwrap();

        assert_eq!(model.apply(ticket, Some(bank(AA, "a", 1))), ApplyOutcome::Materialized);
        let once = model.snapshot();
        assert_eq!(model.apply(ticket, Some(bank(AA, "a", 1))), ApplyOutcome::Stale);
        assert_eq!(*model.snapshot(), *once);
    }

    #[test]
    fn slower_earlier_fetch_does_not_clobber_later_one() {
        let model = ReadModel::new();
        let d1 = discovery(AA, 1);
        model.register(d1.clone());

        let s5 = FetchTicket::new(d1.log_id, 5);
        let s6 = FetchTicket::new(d1.log_id, 6);
        assert_eq!(model.apply(s6, Some(bank(AA, "seq 6", 6))), ApplyOutcome::Materialized);
        assert_eq!(model.apply(s5, Some(bank(AA, "seq 5", 5))), ApplyOutcome::Stale);

        let snapshot = model.snapshot();
        assert_eq!(snapshot[0].display_name, "seq 6");
        assert_eq!(snapshot[0].native_balance, U256::from(6));
    }

    #[test]
    fn stale_absent_cannot_remove_a_fresher_bank() {
        let model = ReadModel::new();
        let d1 = discovery(AA, 1);
        model.register(d1.clone());

        let early = model.begin_fetch(&d1.log_id).unwrap();
        let late = model.begin_fetch(&d1.log_id).unwrap();
        model.apply(late, Some(bank(AA, "a", 1)));
        assert_eq!(model.apply(early, None), ApplyOutcome::Stale);
        assert_eq!(addresses(&model), vec![AA]);
    }

    #[test]
    fn absent_removes_a_materialized_key_for_good() {
        let model = ReadModel::new();
        let d1 = discovery(AA, 1);
        model.register(d1.clone());
        let t1 = model.begin_fetch(&d1.log_id).unwrap();
        model.apply(t1, Some(bank(AA, "a", 1)));

        let t2 = model.begin_fetch(&d1.log_id).unwrap();
        assert_eq!(model.apply(t2, None), ApplyOutcome::Removed);
        assert!(model.snapshot().is_empty());
        assert_eq!(model.state_of(&d1.log_id), Some(EntryState::Removed));

        // Terminal : plus de fetch, et un ticket tardif est ignoré.
        assert!(model.begin_fetch(&d1.log_id).is_none());
        let late = FetchTicket::new(d1.log_id, 99);
        assert_eq!(model.apply(late, Some(bank(AA, "a", 1))), ApplyOutcome::Retired);
        assert!(model.snapshot().is_empty());

        // Une nouvelle découverte de la même adresse la réintroduit.
        let d2 = discovery(AA, 9);
        model.register(d2.clone());
        let t3 = model.begin_fetch(&d2.log_id).unwrap();
        assert_eq!(model.apply(t3, Some(bank(AA, "revenue", 3))), ApplyOutcome::Materialized);
        assert_eq!(addresses(&model), vec![AA]);
    }

    #[test]
    fn absent_on_unresolved_key_leaves_no_trace() {
        let model = ReadModel::new();
        let d1 = discovery(AA, 1);
        model.register(d1.clone());

        let t1 = model.begin_fetch(&d1.log_id).unwrap();
        assert_eq!(model.apply(t1, None), ApplyOutcome::Unchanged);
        assert!(model.snapshot().is_empty());
        assert_eq!(model.state_of(&d1.log_id), Some(EntryState::Unresolved));

        let t2 = model.begin_fetch(&d1.log_id).unwrap();
        assert_eq!(model.apply(t2, Some(bank(AA, "a", 1))), ApplyOutcome::Materialized);
    }

    #[test]
    fn loading_flag_follows_in_flight_fetches() {
        let model = ReadModel::new();
        let d1 = discovery(AA, 1);
        model.register(d1.clone());
        assert!(!model.is_loading(&AA));

        let t1 = model.begin_fetch(&d1.log_id).unwrap();
        let t2 = model.begin_fetch(&d1.log_id).unwrap();
        assert!(model.is_loading(&AA));
        model.apply(t2, Some(bank(AA, "a", 1)));
        assert!(model.is_loading(&AA));
        model.apply(t1, None);
        assert!(!model.is_loading(&AA));
    }

    #[test]
    fn apply_on_unknown_key_is_reported() {
        let model = ReadModel::new();
        let d1 = discovery(AA, 1);
        let ticket = FetchTicket::new(d1.log_id, 1);
        assert_eq!(model.apply(ticket, Some(bank(AA, "a", 1))), ApplyOutcome::UnknownKey);
        assert!(model.snapshot().is_empty());
    }

    #[tokio::test]
    async fn every_effective_change_is_notified_exactly_once() {
        let model = ReadModel::new();
        let mut feed = model.subscribe();
        let d1 = discovery(AA, 1);
        model.register(d1.clone());

        let t1 = model.begin_fetch(&d1.log_id).unwrap();
        model.apply(t1, Some(bank(AA, "a", 1)));
        let t2 = model.begin_fetch(&d1.log_id).unwrap();
        model.apply(t2, Some(bank(AA, "a", 1))); // identique : pas de notification
        let t3 = model.begin_fetch(&d1.log_id).unwrap();
        model.apply(t3, Some(bank(AA, "a", 2)));
        let t4 = model.begin_fetch(&d1.log_id).unwrap();
        model.apply(t4, None);

        let kinds: Vec<ChangeKind> = std::iter::from_fn(|| feed.try_recv().ok())
            .map(|change| change.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::Materialized, ChangeKind::Updated, ChangeKind::Removed]
        );
    }

    #[test]
    fn clear_empties_everything() {
        let model = ReadModel::new();
        let mut feed = model.subscribe();
        let d1 = discovery(AA, 1);
        model.register(d1.clone());
        let t1 = model.begin_fetch(&d1.log_id).unwrap();
        model.apply(t1, Some(bank(AA, "a", 1)));
        let _ = feed.try_recv();

        model.clear();
        assert!(model.snapshot().is_empty());
        assert_eq!(model.key_count(), 0);
        assert_eq!(feed.try_recv().unwrap().kind, ChangeKind::Removed);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use std::collections::HashSet;

        const KEYS: usize = 4;

        #[derive(Debug, Clone)]
        enum Op {
            Register(usize),
            Begin(usize),
            Apply {
                pending: usize,
                result: Option<u64>,
                twice: bool,
            },
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0..KEYS).prop_map(Op::Register),
                (0..KEYS).prop_map(Op::Begin),
                (any::<usize>(), proptest::option::of(0u64..3), any::<bool>()).prop_map(
                    |(pending, result, twice)| Op::Apply {
                        pending,
                        result,
                        twice,
                    }
                ),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig { cases: 128, ..ProptestConfig::default() })]

            #[test]
            fn any_interleaving_keeps_the_snapshot_unique(ops in prop::collection::vec(op(), 1..48)) {
                let model = ReadModel::new();
                // Deux découvertes de 0xAA : réutilisation d'adresse.
                let events: Vec<DiscoveryEvent> = [AA, BB, AA, CC]
                    .iter()
                    .enumerate()
                    .map(|(i, entity)| discovery(*entity, i as u64 + 1))
                    .collect();
                let mut pending: Vec<FetchTicket> = Vec::new();
                let mut removed = [false; KEYS];

                for op in ops {
                    match op {
                        Op::Register(k) => {
                            model.register(events[k].clone());
                        }
                        Op::Begin(k) => {
                            if let Some(ticket) = model.begin_fetch(&events[k].log_id) {
                                pending.push(ticket);
                            }
                        }
                        Op::Apply { pending: i, result, twice } => {
                            if pending.is_empty() {
                                continue;
                            }
                            let ticket = pending.remove(i % pending.len());
                            let entity = events.iter().find(|e| e.log_id == ticket.key).unwrap().entity;
                            let fetched = result.map(|wei| bank(entity, "aléatoire", wei));
                            model.apply(ticket, fetched.clone());

                            if twice {
                                let before = model.snapshot();
                                let again = model.apply(ticket, fetched);
                                prop_assert!(matches!(again, ApplyOutcome::Stale | ApplyOutcome::Retired));
                                prop_assert_eq!(before, model.snapshot());
                            }
                        }
                    }

                    let snapshot = model.snapshot();
                    let unique: HashSet<Address> = snapshot.iter().map(|b| b.address).collect();
                    prop_assert_eq!(unique.len(), snapshot.len());

                    for (k, event) in events.iter().enumerate() {
                        let state = model.state_of(&event.log_id);
                        if removed[k] {
                            prop_assert_eq!(state, Some(EntryState::Removed));
                        }
                        removed[k] = state == Some(EntryState::Removed);
                    }
                }
            }
        }
    }

    #[test]
    fn abandoned_fetches_stop_loading_but_keep_ordering() {
        let model = ReadModel::new();
        let d1 = discovery(AA, 1);
        model.register(d1.clone());
        let t1 = model.begin_fetch(&d1.log_id).unwrap();
        let t2 = model.begin_fetch(&d1.log_id).unwrap();
        assert!(model.is_loading(&AA));

        model.abandon_fetches();
        assert!(!model.is_loading(&AA));

        assert_eq!(model.apply(t2, Some(bank(AA, "récent", 2))), ApplyOutcome::Materialized);
        assert_eq!(model.apply(t1, Some(bank(AA, "ancien", 1))), ApplyOutcome::Stale);
        assert_eq!(model.bank(&d1.log_id).unwrap().display_name, "récent");
    }
}
