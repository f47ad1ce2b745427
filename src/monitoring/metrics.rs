// DANS : src/monitoring/metrics.rs

use lazy_static::lazy_static;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, TextEncoder, register_int_counter,
    register_int_counter_vec, register_int_gauge,
};
use tracing::{error, info};
use warp::Filter;

lazy_static! {
    // --- Découverte ---
    pub static ref DISCOVERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "piggy_discoveries_total",
        "Événements Created traités, par source",
        &["source"] // Labels: "bootstrap", "live"
    ).unwrap();

    // --- Fetchs & Modèle ---
    pub static ref FETCHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "piggy_fetches_total",
        "Fetchs d'entité terminés, par résultat",
        &["outcome"] // Labels: "materialized", "absent"
    ).unwrap();
    pub static ref STALE_RESULTS: IntCounter = register_int_counter!(
        "piggy_stale_results_total", "Résultats de fetch ignorés car dépassés par un fetch plus récent"
    ).unwrap();
    pub static ref BANKS_MATERIALIZED: IntGauge = register_int_gauge!(
        "piggy_banks_materialized", "Nombre de tirelires dans le snapshot publié"
    ).unwrap();

    // --- Santé des Composants Internes ---
    pub static ref ACTIVE_WATCHES: IntGauge = register_int_gauge!(
        "piggy_active_watches", "Nombre d'abonnements d'activité ouverts (un par adresse)"
    ).unwrap();
    pub static ref RPC_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "piggy_rpc_requests_total",
        "Compteur total des requêtes RPC, segmenté par méthode et statut",
        &["method", "status"] // Labels: "owner", "success" / "retry" / "failure"
    ).unwrap();
}

/// Expose `/metrics` sur le port donné. Ne rend la main qu'à l'arrêt du serveur.
pub async fn start_metrics_server(port: u16) {
    let metrics_route = warp::path!("metrics").map(|| {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
            error!(error = %e, "[Monitoring] Échec d'encodage des métriques.");
        }
        warp::reply::with_header(buffer, "content-type", "text/plain; version=0.0.4")
    });
    info!(port, "[Monitoring] Serveur de métriques exposé sur /metrics");
    warp::serve(metrics_route).run(([0, 0, 0, 0], port)).await;
}
