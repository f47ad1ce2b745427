use anyhow::Result;
use piggy_sync::{
    chain::alloy_client::AlloyChainClient,
    communication::LogNotifier,
    config::Config,
    data_pipeline::{NetworkCheck, NetworkSupervisor, RegistrySync},
    monitoring::{logging, metrics},
    rpc::resilient_client::ResilientChainClient,
    state::{ReadModel, export},
};
use std::{path::PathBuf, sync::Arc};
use tracing::{error, info, warn};

type Client = ResilientChainClient<AlloyChainClient>;

/// Prépare la synchronisation de `chain_id`. `None` si aucune fabrique
/// n'est connue pour ce réseau.
fn build_registry(
    config: &Config,
    client: &Arc<Client>,
    model: &Arc<ReadModel>,
    chain_id: u64,
) -> Result<Option<RegistrySync<Client>>> {
    let factory = match config.factory_for(chain_id) {
        Ok(factory) => factory,
        Err(e) => {
            warn!(chain_id, error = %e, "[Main] Pas de fabrique pour ce réseau.");
            return Ok(None);
        }
    };

    Ok(Some(
        RegistrySync::new(client.clone(), model.clone(), factory)
            .with_start_block(config.start_block)
            .with_account(config.account()?)
            .with_notifier(Arc::new(LogNotifier))
            .with_unresolved_retry(config.unresolved_retry_limit, config.unresolved_retry_delay()),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::setup_logging();
    info!("--- Démarrage de piggy-sync ---");

    let config = Config::load()?;

    if let Some(port) = config.metrics_port {
        tokio::spawn(metrics::start_metrics_server(port));
    }

    let transport = AlloyChainClient::connect_http(&config.rpc_url, config.poll_interval())?;
    let client = Arc::new(ResilientChainClient::new(
        transport,
        config.max_retries,
        config.retry_delay_ms,
    ));
    let model = Arc::new(ReadModel::new());

    if let Some(path) = &config.snapshot_export_path {
        export::spawn_snapshot_exporter(model.clone(), PathBuf::from(path));
        info!(path = %path, "[Main] Export du snapshot activé.");
    }

    // Le premier tick est immédiat : c'est lui qui lance la première synchronisation.
    let mut network_check = tokio::time::interval(config.network_check_interval());
    let mut supervisor = NetworkSupervisor::new(client.clone(), model.clone());

    // Un seul écouteur pour toute la durée du service : un Ctrl-C reçu
    // pendant un démarrage n'est pas perdu.
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = network_check.tick() => {
                let check = supervisor
                    .check(|chain_id| build_registry(&config, &client, &model, chain_id))
                    .await;
                match check {
                    Ok(NetworkCheck::Unchanged) => {}
                    Ok(NetworkCheck::Started { chain_id, banks }) => {
                        info!(chain_id, banks, "[Main] Tirelires de l'historique en cours de chargement.");
                    }
                    Ok(NetworkCheck::Unsupported { chain_id }) => {
                        error!(chain_id, "[Main] Réseau non supporté, synchronisation suspendue.");
                    }
                    // Le prochain tick réessaiera.
                    Err(e) => error!(error = ?e, "[Main] Synchronisation impossible."),
                }
            }
            _ = &mut ctrl_c => {
                info!(banks = model.snapshot().len(), "[Main] Arrêt demandé.");
                break;
            }
        }
    }

    supervisor.shutdown();
    Ok(())
}
