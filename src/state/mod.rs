// src/state/mod.rs

// Le modèle de lecture et ses types. Tout ce que l'UI (ou l'export) lit
// passe par `ReadModel::snapshot`.
pub mod export;
pub mod filter;
pub mod model;
pub mod read_model;

pub use filter::SnapshotFilter;
pub use model::{ActivityEvent, ActivityKind, Bank, BlockPointer, Collectible, DiscoveryEvent, LogId, Token};
pub use read_model::{ApplyOutcome, ChangeKind, EntryState, FetchTicket, ModelChange, ReadModel};
