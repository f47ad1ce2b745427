use anyhow::{Context, Result, bail};
use alloy::primitives::Address;
use piggy_sync::{
    chain::alloy_client::AlloyChainClient,
    config::Config,
    data_pipeline::EntityFetcher,
    monitoring::logging,
    rpc::resilient_client::ResilientChainClient,
};
use std::sync::Arc;

/// Fetch ponctuel d'une tirelire : `bank_inspector <adresse>`.
/// Affiche le `Bank` en JSON, ou "absent" si l'entité n'est pas matérialisable.
#[tokio::main]
async fn main() -> Result<()> {
    logging::setup_cli_logging();

    let Some(raw) = std::env::args().nth(1) else {
        bail!("Usage : bank_inspector <adresse de la tirelire>");
    };
    let address: Address = raw
        .parse()
        .with_context(|| format!("Adresse invalide : {}", raw))?;

    let config = Config::load()?;
    let transport = AlloyChainClient::connect_http(&config.rpc_url, config.poll_interval())?;
    let client = ResilientChainClient::new(transport, config.max_retries, config.retry_delay_ms);
    let fetcher = EntityFetcher::new(Arc::new(client));

    match fetcher.fetch(address).await {
        Some(bank) => {
            let json = serde_json::to_string_pretty(&bank).context("Échec de la sérialisation")?;
            println!("{}", json);
        }
        None => println!("absent"),
    }
    Ok(())
}
