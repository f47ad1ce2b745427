// DANS : src/communication.rs

use crate::state::Bank;
use alloy::primitives::{Address, U256, utils::format_ether};
use serde::Serialize;
use tracing::info;

// --- PROTOCOLE POUR LES NOTIFICATIONS ---

/// Notification destinée au propriétaire d'une tirelire.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

/// Collaborateur "fire-and-forget" : un échec d'envoi est ignoré par l'appelant.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Implémentation par défaut : la notification part dans les logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        info!(title = %notification.title, body = %notification.body, "[Notifier] Notification.");
    }
}

/// N'envoie rien. Utilisé quand aucun compte n'est configuré.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _: Notification) {}
}

/// "Received 0.5 ethers from 0x…", titré du nom de la tirelire.
pub fn received_notification(bank: &Bank, sender: Address, amount: U256) -> Notification {
    Notification {
        title: bank.display_name.clone(),
        body: format!("Received {} ethers from {}", format_ether(amount), sender),
    }
}
