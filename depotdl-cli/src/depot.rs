/*!
The `depot` subcommand and the shared download loop: zip manifests with
their keys and run one engine per depot, sequentially, off a single shared
session handle.
*/

use crate::cli::Opt;

use anyhow::{bail, Context, Result};
use depotdl::engine::{DepotEngine, EngineConfig};
use depotdl::session::{SessionHandle, WebApiSession};
use depotdl_core::crypto::DepotKey;
use depotdl_core::manifest::DepotManifest;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

pub async fn run(
    options: &Opt,
    manifest_paths: &[PathBuf],
    depot_keys: &[String],
    cancel: CancellationToken,
) -> Result<()> {
    if manifest_paths.len() != depot_keys.len() {
        bail!(
            "got {} manifests but {} depot keys; they pair positionally",
            manifest_paths.len(),
            depot_keys.len()
        );
    }
    let pairs = manifest_paths
        .iter()
        .cloned()
        .zip(depot_keys.iter().cloned())
        .collect();
    download_all(options, pairs, options.save_path.clone(), cancel).await
}

/// Downloads every (manifest, key) pair in order, sharing one session
/// handle so the engines reuse each other's CDN auth tokens
pub async fn download_all(
    options: &Opt,
    pairs: Vec<(PathBuf, String)>,
    save_path: Option<PathBuf>,
    cancel: CancellationToken,
) -> Result<()> {
    if pairs.is_empty() {
        warn!("nothing to download");
        return Ok(());
    }

    let session = SessionHandle::new(Arc::new(WebApiSession::new()?));

    for (manifest_path, key_hex) in pairs {
        let bytes = fs::read(&manifest_path)
            .with_context(|| format!("failed to read manifest {:?}", manifest_path))?;
        let manifest = DepotManifest::decode(&bytes)
            .with_context(|| format!("failed to decode manifest {:?}", manifest_path))?;
        let key = DepotKey::from_hex(&key_hex)
            .with_context(|| format!("bad decryption key for depot {}", manifest.depot_id))?;

        info!(
            depot = manifest.depot_id,
            manifest = %manifest_path.display(),
            "starting depot download"
        );
        let config = EngineConfig {
            worker_count: options.thread_num,
            save_path: save_path.clone(),
            retry_num: options.retry_num,
            ledger_path: None,
            servers: options.servers(),
            show_progress: true,
        };
        let engine = DepotEngine::new(
            manifest,
            key,
            Arc::clone(&session),
            options.login_anonymous,
            config,
        )?;
        engine.download(cancel.clone()).await?;

        if cancel.is_cancelled() {
            bail!("interrupted");
        }
    }
    Ok(())
}
