// DANS : src/state/export.rs

use super::{model::Bank, read_model::ReadModel};
use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{error, warn};

/// Écrit le snapshot en JSON. Passe par un fichier temporaire puis un
/// renommage : un lecteur ne voit jamais un fichier à moitié écrit.
pub fn write_snapshot(path: &Path, banks: &[Bank]) -> Result<()> {
    let json_data = serde_json::to_string_pretty(banks)
        .context("Échec de la sérialisation du snapshot en JSON")?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json_data)
        .with_context(|| format!("Échec de l'écriture de {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Échec du remplacement de {}", path.display()))?;
    Ok(())
}

/// Réécrit le fichier à chaque changement du modèle.
pub fn spawn_snapshot_exporter(model: Arc<ReadModel>, path: PathBuf) -> JoinHandle<()> {
    let mut changes = model.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(_) => {}
                // Des changements ont été perdus : le snapshot courant les contient.
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "[Export] Changements sautés, réécriture complète.")
                }
                Err(RecvError::Closed) => break,
            }
            if let Err(e) = write_snapshot(&path, &model.snapshot()) {
                error!(error = ?e, "[Export] Échec de l'export du snapshot.");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, U256};
    use chrono::Utc;

    #[test]
    fn snapshot_is_written_as_a_json_array() {
        let path = std::env::temp_dir().join(format!("piggy-export-{}.json", std::process::id()));
        let banks = vec![Bank {
            address: Address::with_last_byte(0xaa),
            display_name: "Vacances".into(),
            owner: Address::with_last_byte(0xcc),
            native_balance: U256::from(12u64),
            tokens: vec![],
            collectibles: vec![],
            last_synced_at: Utc::now(),
        }];

        write_snapshot(&path, &banks).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(parsed.as_array().map(Vec::len), Some(1));
        assert_eq!(parsed[0]["display_name"], "Vacances");
    }
}
