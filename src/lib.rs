// src/lib.rs

// On déclare tous nos modules principaux pour les rendre publics et
// utilisables par nos programmes binaires (piggy_daemon.rs, bank_inspector.rs).
pub mod chain;
pub mod communication;
pub mod config;
pub mod data_pipeline;
pub mod monitoring;
pub mod rpc;
pub mod state;
