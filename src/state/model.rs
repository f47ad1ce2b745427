// DANS : src/state/model.rs

use crate::chain::{
    ChainError, ChainLog,
    abi::{IPiggyBank, IPiggyBanks, decode_bytes32_text},
};
use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::SolEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Position d'un log dans la chaîne.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BlockPointer {
    pub number: u64,
    pub hash: B256,
}

/// Identité stable et unique d'un log : c'est la clé du modèle de lecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LogId {
    pub transaction_hash: B256,
    pub log_index: u64,
}

/// Un événement `Created` de la fabrique. Immuable une fois observé.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryEvent {
    pub entity: Address,
    pub block: BlockPointer,
    pub log_id: LogId,
}

impl DiscoveryEvent {
    pub fn decode(log: &ChainLog) -> Result<Self, ChainError> {
        let created = decode_event::<IPiggyBanks::Created>(log)?;
        Ok(Self {
            entity: created.piggyBank,
            block: BlockPointer {
                number: log.block_number,
                hash: log.block_hash,
            },
            log_id: LogId {
                transaction_hash: log.transaction_hash,
                log_index: log.log_index,
            },
        })
    }

    /// Ordre de découverte : bloc, puis index du log.
    pub fn chain_position(&self) -> (u64, u64) {
        (self.block.number, self.log_id.log_index)
    }
}

/// Un token fongible détenu par une tirelire, lu au moment du fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Token {
    pub contract: Address,
    pub name: String,
    pub symbol: String,
    /// En plus petite unité du token.
    pub balance: U256,
}

/// Un groupe de collectibles (ERC721) d'un même contrat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collectible {
    pub contract: Address,
    /// `name()` est optionnel chez les ERC721 ; `None` si l'appel échoue.
    pub name: Option<String>,
    pub held_token_ids: Vec<U256>,
}

/// Instantané dérivé d'une tirelire. Toujours remplacé en bloc, jamais patché.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bank {
    pub address: Address,
    pub display_name: String,
    pub owner: Address,
    /// En wei.
    pub native_balance: U256,
    pub tokens: Vec<Token>,
    pub collectibles: Vec<Collectible>,
    pub last_synced_at: DateTime<Utc>,
}

/// Ce qu'un événement de la tirelire raconte, selon son type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityKind {
    Received { sender: Address, amount: U256 },
    Transferred { owner: Address },
    TokenAdded { token: Address },
    Renamed { name: String },
    Freed,
    /// Signature inconnue ou données illisibles : déclenche quand même une resync.
    Other,
}

/// Un log émis par l'adresse d'une tirelire après sa création.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEvent {
    pub bank: Address,
    pub block_number: u64,
    pub kind: ActivityKind,
}

impl ActivityEvent {
    pub fn decode(log: &ChainLog) -> Self {
        Self {
            bank: log.address,
            block_number: log.block_number,
            kind: decode_activity_kind(log),
        }
    }
}

fn decode_activity_kind(log: &ChainLog) -> ActivityKind {
    let Some(topic0) = log.topic0() else {
        return ActivityKind::Other;
    };

    let decoded = if topic0 == IPiggyBank::Received::SIGNATURE_HASH {
        decode_event::<IPiggyBank::Received>(log).map(|e| ActivityKind::Received {
            sender: e.sender,
            amount: e.amount,
        })
    } else if topic0 == IPiggyBank::Transferred::SIGNATURE_HASH {
        decode_event::<IPiggyBank::Transferred>(log).map(|e| ActivityKind::Transferred { owner: e.owner })
    } else if topic0 == IPiggyBank::TokenAdded::SIGNATURE_HASH {
        decode_event::<IPiggyBank::TokenAdded>(log).map(|e| ActivityKind::TokenAdded { token: e.token })
    } else if topic0 == IPiggyBank::Renamed::SIGNATURE_HASH {
        decode_event::<IPiggyBank::Renamed>(log).map(|e| ActivityKind::Renamed {
            name: decode_bytes32_text(e.name),
        })
    } else if topic0 == IPiggyBank::Freed::SIGNATURE_HASH {
        Ok(ActivityKind::Freed)
    } else {
        Ok(ActivityKind::Other)
    };

    decoded.unwrap_or(ActivityKind::Other)
}

fn decode_event<E: SolEvent>(log: &ChainLog) -> Result<E, ChainError> {
    let data = alloy::primitives::LogData::new_unchecked(log.topics.clone(), log.data.clone());
    E::decode_log_data(&data).map_err(|e| ChainError::Decode(format!("{}: {}", E::SIGNATURE, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::abi::encode_bytes32_text;
    use alloy::primitives::{Bytes, address};

    fn log_from<E: SolEvent>(emitter: Address, event: &E) -> ChainLog {
        let data = event.encode_log_data();
        ChainLog {
            address: emitter,
            topics: data.topics().to_vec(),
            data: data.data.clone(),
            block_number: 7,
            block_hash: B256::repeat_byte(0x07),
            transaction_hash: B256::repeat_byte(0x70),
            log_index: 2,
        }
    }

    #[test]
    fn discovery_event_is_keyed_by_log_identity() {
        let factory = address!("08f6e0571bcda646d11371c0dab7d9a72be6bb8e");
        let bank = address!("00000000000000000000000000000000000000aa");
        let log = log_from(factory, &IPiggyBanks::Created { piggyBank: bank });

        let event = DiscoveryEvent::decode(&log).unwrap();
        assert_eq!(event.entity, bank);
        assert_eq!(event.chain_position(), (7, 2));
        assert_eq!(event.log_id.transaction_hash, B256::repeat_byte(0x70));
    }

    #[test]
    fn discovery_decode_rejects_foreign_event() {
        let bank = address!("00000000000000000000000000000000000000aa");
        let log = log_from(bank, &IPiggyBank::Freed {});
        assert!(matches!(DiscoveryEvent::decode(&log), Err(ChainError::Decode(_))));
    }

    #[test]
    fn activity_kinds_are_decoded_from_bank_logs() {
        let bank = address!("00000000000000000000000000000000000000aa");
        let sender = address!("00000000000000000000000000000000000000cc");

        let received = ActivityEvent::decode(&log_from(
            bank,
            &IPiggyBank::Received { sender, amount: U256::from(42u64) },
        ));
        assert_eq!(
            received.kind,
            ActivityKind::Received { sender, amount: U256::from(42u64) }
        );

        let renamed = ActivityEvent::decode(&log_from(
            bank,
            &IPiggyBank::Renamed { name: encode_bytes32_text("Vacances") },
        ));
        assert_eq!(renamed.kind, ActivityKind::Renamed { name: "Vacances".into() });

        let freed = ActivityEvent::decode(&log_from(bank, &IPiggyBank::Freed {}));
        assert_eq!(freed.kind, ActivityKind::Freed);
        assert_eq!(freed.bank, bank);
    }

    #[test]
    fn unknown_or_malformed_activity_is_other() {
        let bank = address!("00000000000000000000000000000000000000aa");
        let unknown = ChainLog {
            address: bank,
            topics: vec![B256::repeat_byte(0xee)],
            data: Bytes::new(),
            block_number: 1,
            block_hash: B256::ZERO,
            transaction_hash: B256::ZERO,
            log_index: 0,
        };
        assert_eq!(ActivityEvent::decode(&unknown).kind, ActivityKind::Other);

        let truncated = ChainLog {
            topics: vec![IPiggyBank::Received::SIGNATURE_HASH],
            ..unknown
        };
        assert_eq!(ActivityEvent::decode(&truncated).kind, ActivityKind::Other);

        // Une tirelire n'émet jamais `Created` : c'est un log quelconque.
        let created = log_from(bank, &IPiggyBanks::Created { piggyBank: bank });
        assert_eq!(ActivityEvent::decode(&created).kind, ActivityKind::Other);
    }
}
