// src/rpc/mod.rs

// Décorateurs autour de la capacité `ChainClient`.
pub mod resilient_client;
