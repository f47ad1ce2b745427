use alloy::primitives::{Address, address};
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::time::Duration;

/// Fabriques PiggyBanks déployées, par chain id.
const KNOWN_FACTORIES: &[(u64, Address)] = &[
    (1, address!("08f6e0571bcda646d11371c0dab7d9a72be6bb8e")),
    (3, address!("1b723ed1ea1d145444c4bab8fbd4f8ff886bffa3")),
];

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub rpc_url: String,
    /// Surcharge la fabrique connue du réseau.
    pub factory_address: Option<String>,
    /// Compte de l'utilisateur (vue "mes tirelires", notifications).
    pub account: Option<String>,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_network_check_secs")]
    pub network_check_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_unresolved_retry_limit")]
    pub unresolved_retry_limit: u32,
    #[serde(default = "default_unresolved_retry_delay_ms")]
    pub unresolved_retry_delay_ms: u64,
    pub metrics_port: Option<u16>,
    pub snapshot_export_path: Option<String>,
}

fn default_poll_interval_ms() -> u64 {
    4_000
}

fn default_network_check_secs() -> u64 {
    10
}

fn default_max_retries() -> u8 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_unresolved_retry_limit() -> u32 {
    3
}

fn default_unresolved_retry_delay_ms() -> u64 {
    5_000
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = envy::from_env::<Config>().context("Configuration invalide (variables d'environnement)")?;
        Ok(config)
    }

    /// La fabrique à suivre sur `chain_id` : celle de `FACTORY_ADDRESS` si
    /// définie, sinon la fabrique connue du réseau.
    pub fn factory_for(&self, chain_id: u64) -> Result<Address> {
        match &self.factory_address {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("FACTORY_ADDRESS invalide : {}", raw)),
            None => default_factory(chain_id)
                .ok_or_else(|| anyhow!("Aucune fabrique PiggyBanks connue pour le réseau {}", chain_id)),
        }
    }

    pub fn account(&self) -> Result<Option<Address>> {
        self.account
            .as_deref()
            .map(|raw| raw.parse().with_context(|| format!("ACCOUNT invalide : {}", raw)))
            .transpose()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn network_check_interval(&self) -> Duration {
        Duration::from_secs(self.network_check_secs)
    }

    pub fn unresolved_retry_delay(&self) -> Duration {
        Duration::from_millis(self.unresolved_retry_delay_ms)
    }
}

pub fn default_factory(chain_id: u64) -> Option<Address> {
    KNOWN_FACTORIES
        .iter()
        .find(|(id, _)| *id == chain_id)
        .map(|(_, factory)| *factory)
}
