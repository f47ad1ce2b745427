// src/data_pipeline/mod.rs

// On déclare les différents composants de notre pipeline de données :
// la découverte/surveillance des tirelires, le fetch de leur état et le
// suivi du réseau courant.
pub mod fetcher;
pub mod network;
pub mod registry;

pub use fetcher::{EntityFetcher, MAX_ENUMERATED_ITEMS};
pub use network::{NetworkCheck, NetworkSupervisor};
pub use registry::RegistrySync;
