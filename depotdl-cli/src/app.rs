/*!
The `app` subcommand: scan an app directory for manifests, pair each with
its decryption key from the sibling `config.vdf`, and download the lot.
*/

use crate::cli::Opt;
use crate::depot;

use anyhow::{anyhow, Context, Result};
use depotdl_core::manifest::DepotManifest;
use depotdl_core::vdf;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub async fn run(options: &Opt, app_path: &Path, cancel: CancellationToken) -> Result<()> {
    let pairs = scan_app_dir(app_path)?;

    // Without an explicit save path the depot lands next to the working
    // directory, named after the app directory
    let save_path = match &options.save_path {
        Some(path) => path.clone(),
        None => {
            let name = app_path
                .file_name()
                .ok_or_else(|| anyhow!("app path {:?} has no base name", app_path))?;
            std::env::current_dir()?.join(name)
        }
    };

    depot::download_all(options, pairs, Some(save_path), cancel).await
}

/// Pairs every `*.manifest` file in the directory with the decryption key
/// `config.vdf` lists for its depot. Manifests without a key are skipped.
pub fn scan_app_dir(path: &Path) -> Result<Vec<(PathBuf, String)>> {
    if !path.is_dir() {
        return Err(anyhow!("{:?} is not a directory", path));
    }

    let mut manifest_paths: Vec<PathBuf> = Vec::new();
    let mut keys: HashMap<u32, String> = HashMap::new();
    for entry in fs::read_dir(path).with_context(|| format!("failed to scan {:?}", path))? {
        let entry = entry?;
        let entry_path = entry.path();
        if !entry_path.is_file() {
            continue;
        }
        if entry_path.extension().map_or(false, |ext| ext == "manifest") {
            manifest_paths.push(entry_path);
        } else if entry_path.file_name().map_or(false, |name| name == "config.vdf") {
            keys = depot_keys(&entry_path)?;
        }
    }
    manifest_paths.sort();

    let mut pairs = Vec::new();
    for manifest_path in manifest_paths {
        let bytes = fs::read(&manifest_path)
            .with_context(|| format!("failed to read manifest {:?}", manifest_path))?;
        let manifest = DepotManifest::decode(&bytes)
            .with_context(|| format!("failed to decode manifest {:?}", manifest_path))?;
        match keys.get(&manifest.depot_id) {
            Some(key) => pairs.push((manifest_path, key.clone())),
            None => {
                warn!(
                    depot = manifest.depot_id,
                    manifest = %manifest_path.display(),
                    "config.vdf holds no decryption key for this depot, skipping"
                );
            }
        }
    }
    Ok(pairs)
}

/// Reads `depots → <id> → DecryptionKey` out of a `config.vdf`
fn depot_keys(path: &Path) -> Result<HashMap<u32, String>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    let document =
        vdf::parse(&text).with_context(|| format!("failed to parse {:?}", path))?;

    let mut keys = HashMap::new();
    if let Some(depots) = document.get("depots").and_then(vdf::Value::as_table) {
        for (depot_id, depot) in depots {
            let depot_id = match depot_id.parse::<u32>() {
                Ok(depot_id) => depot_id,
                Err(_) => continue,
            };
            if let Some(key) = depot.get("DecryptionKey").and_then(vdf::Value::as_str) {
                keys.insert(depot_id, key.to_string());
            }
        }
    }
    Ok(keys)
}
