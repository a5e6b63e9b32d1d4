/*!
The download engine: one instance per depot.

The scheduler walks the manifest, materializes the file tree, and feeds
every chunk the ledger does not already list into a bounded channel drained
by a fixed set of worker tasks. Each worker runs the whole pipeline for its
chunk: acquire an endpoint, fetch, decrypt, decompress, verify, write at
the chunk's offset under the owning file's lock, and record the chunk in
the ledger. A ticker checkpoints the ledger while work is outstanding, and
one final checkpoint runs no matter how the download ends.

Worker failures are logged and isolated; a chunk whose job failed simply
stays out of the ledger and is retried by the next run.
*/

use crate::layout;
use crate::ledger::{LedgerError, ResumeLedger};
use crate::pool::{PoolError, ServerPool};
use crate::session::SessionHandle;

use depotdl_core::chunk::{self, ChunkError};
use depotdl_core::crypto::DepotKey;
use depotdl_core::manifest::{ChunkRecord, DepotManifest};

use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::task;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use std::cmp;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How often the resume ledger is flushed while work is outstanding
const CHECKPOINT_INTERVAL: Duration = Duration::from_millis(100);
/// Per attempt timeout on chunk requests
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause before rotating away from an endpoint that answered 5xx
const SERVER_ERROR_BACKOFF: Duration = Duration::from_millis(500);
/// Pause before rotating away after a transport failure
const TRANSPORT_BACKOFF: Duration = Duration::from_millis(100);
/// Pause between attempts to reopen a target file another process holds
const WRITE_RETRY_PAUSE: Duration = Duration::from_millis(10);

/// Error that aborts a whole depot download
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("resume ledger failure")]
    Ledger(#[from] LedgerError),
    #[error("failed to lay out {path:?}")]
    Layout {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to build the http client")]
    Client(#[from] reqwest::Error),
}

type Result<T> = std::result::Result<T, EngineError>;

/// Error of a single chunk job; logged, never propagated to peers
#[derive(Error, Debug)]
enum JobError {
    #[error("HTTP {0} from the cdn")]
    HttpClientError(StatusCode),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("chunk failed to decode")]
    Chunk(#[from] ChunkError),
    #[error("positional write failed")]
    IO(#[from] std::io::Error),
    #[error("worker task failed to join")]
    Join(#[from] task::JoinError),
    #[error("cancelled")]
    Cancelled,
}

/// Knobs for a [`DepotEngine`]
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Number of concurrent chunk workers
    pub worker_count: usize,
    /// Directory the depot is reconstructed under; `./<depot_id>` if unset
    pub save_path: Option<PathBuf>,
    /// Transport level attempts per endpoint before rotating
    pub retry_num: u32,
    /// Resume ledger location; `<depot_id>.json` in the working directory
    /// if unset
    pub ledger_path: Option<PathBuf>,
    /// Endpoints to seed the server pool with, ahead of the directory
    pub servers: Vec<String>,
    /// Draw a progress bar on stderr
    pub show_progress: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            worker_count: 32,
            save_path: None,
            retry_num: 3,
            ledger_path: None,
            servers: Vec::new(),
            show_progress: false,
        }
    }
}

/// The engine downloading one depot
pub struct DepotEngine {
    manifest: DepotManifest,
    save_path: PathBuf,
    initial_servers: Vec<String>,
    worker_count: usize,
    ledger: Arc<ResumeLedger>,
    ctx: Arc<WorkerContext>,
}

/// Everything a chunk worker needs, shared behind one `Arc`
struct WorkerContext {
    depot_id: u32,
    key: DepotKey,
    pool: ServerPool,
    client: reqwest::Client,
    ledger: Arc<ResumeLedger>,
    progress: ProgressBar,
    total_size: u64,
    /// Bytes completed per file, for the per chunk progress log line
    file_progress: Mutex<HashMap<String, u64>>,
    retry_num: u32,
}

/// One chunk bound to its target file
struct ChunkJob {
    /// Ledger key of the owning file (normalized relative path)
    file_key: String,
    /// Absolute path of the target file
    path: PathBuf,
    /// Size of the owning file, for progress accounting
    file_size: u64,
    chunk: ChunkRecord,
    /// Serializes the seek+write sequence against siblings in the same file
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl DepotEngine {
    /// Sets up an engine for one manifest: loads the resume ledger and
    /// prepares the endpoint pool. Nothing touches the network until
    /// [`DepotEngine::download`].
    ///
    /// `authenticated` enables CDN auth token management through the
    /// session handle, which is shared across the engines of a run.
    pub fn new(
        manifest: DepotManifest,
        key: DepotKey,
        session: Arc<SessionHandle>,
        authenticated: bool,
        config: EngineConfig,
    ) -> Result<DepotEngine> {
        let depot_id = manifest.depot_id;
        let save_path = config
            .save_path
            .unwrap_or_else(|| PathBuf::from(depot_id.to_string()));
        let ledger_path = config
            .ledger_path
            .unwrap_or_else(|| PathBuf::from(format!("{}.json", depot_id)));
        let ledger = Arc::new(ResumeLedger::open(ledger_path)?);

        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let pool = ServerPool::new(depot_id, session, authenticated);

        let progress = if config.show_progress {
            let bar = ProgressBar::new(manifest.total_size);
            if let Ok(style) = ProgressStyle::with_template(
                "{prefix} {wide_bar} {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
            ) {
                bar.set_style(style);
            }
            bar.set_prefix(format!("depot {}", depot_id));
            bar
        } else {
            ProgressBar::hidden()
        };

        let ctx = Arc::new(WorkerContext {
            depot_id,
            key,
            pool,
            client,
            ledger: Arc::clone(&ledger),
            progress,
            total_size: cmp::max(manifest.total_size, 1),
            file_progress: Mutex::new(HashMap::new()),
            retry_num: config.retry_num,
        });

        Ok(DepotEngine {
            manifest,
            save_path,
            initial_servers: config.servers,
            worker_count: cmp::max(config.worker_count, 1),
            ledger,
            ctx,
        })
    }

    /// Where the depot is being reconstructed
    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    /// Runs the download to completion or until `cancel` fires.
    ///
    /// Either way the ledger is checkpointed one last time before this
    /// returns, so the next run resumes from whatever finished.
    ///
    /// # Errors
    ///
    /// Only engine level failures surface here: an unpopulatable server
    /// pool, ledger I/O errors, or a file tree that cannot be laid out.
    /// Individual chunk failures are logged and left for a future run.
    pub async fn download(&self, cancel: CancellationToken) -> Result<()> {
        // Workers observe a child token, so the engine can stop its own
        // workers on a fatal error without cancelling the caller's token
        let cancel = cancel.child_token();

        self.ctx.pool.add(self.initial_servers.iter().cloned()).await;
        self.ctx.pool.ensure_servers().await?;

        let jobs = self.plan_jobs()?;
        info!(
            depot = self.manifest.depot_id,
            outstanding = jobs.len(),
            "scheduling chunk downloads"
        );

        // Same queue sizing as a fixed worker pipeline wants: a bit more
        // depth than workers, never zero
        let queue_depth = (self.worker_count * 3) / 2 + 1;
        let (tx, rx) = async_channel::bounded::<ChunkJob>(queue_depth);

        let mut workers = Vec::with_capacity(self.worker_count);
        for _ in 0..self.worker_count {
            let rx = rx.clone();
            let ctx = Arc::clone(&self.ctx);
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                while let Ok(job) = rx.recv().await {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let file = job.file_key.clone();
                    let sha = job.chunk.sha_hex();
                    match ctx.run_job(job, &cancel).await {
                        Ok(()) => {}
                        Err(JobError::Cancelled) => break,
                        Err(err) => {
                            error!(file = %file, chunk = %sha, error = %err, "chunk download failed");
                        }
                    }
                }
            }));
        }
        drop(rx);

        let feeder = {
            let cancel = cancel.clone();
            async move {
                for job in jobs {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = tx.send(job) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                // Dropping the sender closes the channel; idle workers exit
            }
        };
        let work = async move {
            feeder.await;
            join_all(workers).await;
        };
        tokio::pin!(work);

        let mut ticker = interval(CHECKPOINT_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut work => break,
                _ = ticker.tick() => {
                    let ledger = Arc::clone(&self.ledger);
                    match task::spawn_blocking(move || ledger.save()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            // A ledger that cannot be persisted voids the
                            // whole resume contract
                            cancel.cancel();
                            (&mut work).await;
                            return Err(EngineError::Ledger(err));
                        }
                        Err(join_err) => {
                            warn!(error = %join_err, "checkpoint task failed to join");
                        }
                    }
                }
            }
        }

        self.ledger.save()?;
        if cancel.is_cancelled() {
            info!(
                depot = self.manifest.depot_id,
                "download interrupted, progress checkpointed"
            );
        } else {
            self.ctx.progress.finish();
            info!(depot = self.manifest.depot_id, "depot complete");
        }
        Ok(())
    }

    /// Walks the manifest: lays out the file tree, counts already-complete
    /// chunks toward progress, and collects a job for everything else
    fn plan_jobs(&self) -> Result<Vec<ChunkJob>> {
        let mut jobs = Vec::new();
        for mapping in &self.manifest.mappings {
            let file_key = mapping.normalized_filename();
            let path = self.save_path.join(&file_key);

            if mapping.is_directory() {
                layout::ensure_directory(&path).map_err(|source| EngineError::Layout {
                    path: path.clone(),
                    source,
                })?;
                continue;
            }

            if !path.exists() && self.ledger.reset_file(&file_key) {
                // The file vanished since the last run, so its recorded
                // progress is void
                info!(file = %file_key, "target file missing, resetting its ledger entry");
                self.ledger.save()?;
            }
            layout::prepare_file(&path, mapping.size).map_err(|source| EngineError::Layout {
                path: path.clone(),
                source,
            })?;
            self.ledger.ensure_file(&file_key);

            let write_lock = Arc::new(tokio::sync::Mutex::new(()));
            let mut chunks = mapping.chunks.clone();
            chunks.sort_by_key(|chunk| chunk.offset);
            for chunk in chunks {
                let chunk_key = ResumeLedger::chunk_key(chunk.offset, &chunk.sha);
                if self.ledger.contains(&file_key, &chunk_key) {
                    self.ctx.progress.inc(u64::from(chunk.cb_original));
                } else {
                    jobs.push(ChunkJob {
                        file_key: file_key.clone(),
                        path: path.clone(),
                        file_size: cmp::max(mapping.size, 1),
                        chunk,
                        write_lock: Arc::clone(&write_lock),
                    });
                }
            }
        }
        Ok(jobs)
    }
}

impl WorkerContext {
    /// The whole pipeline for one chunk: fetch, decode, write, record
    async fn run_job(&self, job: ChunkJob, cancel: &CancellationToken) -> std::result::Result<(), JobError> {
        let chunk_hex = job.chunk.sha_hex();

        let (mut endpoint, mut token) = self.pool.acquire(false).await?;
        let body = loop {
            let url = format!(
                "{}/depot/{}/chunk/{}{}",
                endpoint, self.depot_id, chunk_hex, token
            );
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(JobError::Cancelled),
                response = self.fetch(&url) => response,
            };
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        match response.bytes().await {
                            Ok(bytes) => break bytes,
                            Err(err) => {
                                debug!(chunk = %chunk_hex, error = %err, "failed reading chunk body");
                                sleep(TRANSPORT_BACKOFF).await;
                            }
                        }
                    } else if status.is_client_error() {
                        // Permanent for this run; a future run retries it
                        return Err(JobError::HttpClientError(status));
                    } else {
                        debug!(chunk = %chunk_hex, %status, "cdn returned a server error");
                        sleep(SERVER_ERROR_BACKOFF).await;
                    }
                }
                Err(err) => {
                    debug!(chunk = %chunk_hex, error = %err, "transport error fetching chunk");
                    sleep(TRANSPORT_BACKOFF).await;
                }
            }
            let (next_endpoint, next_token) = self.pool.acquire(true).await?;
            endpoint = next_endpoint;
            token = next_token;
        };

        let key = self.key.clone();
        let ciphertext = body.to_vec();
        let data = task::spawn_blocking(move || chunk::decode(&ciphertext, &key)).await??;
        if data.len() != job.chunk.cb_original as usize {
            debug!(
                chunk = %chunk_hex,
                expected = job.chunk.cb_original,
                actual = data.len(),
                "decoded length differs from the manifest"
            );
        }

        {
            let _write = job.write_lock.lock().await;
            let path = job.path.clone();
            let offset = job.chunk.offset;
            task::spawn_blocking(move || write_at(&path, offset, &data)).await??;
        }

        self.ledger.record(
            &job.file_key,
            ResumeLedger::chunk_key(job.chunk.offset, &job.chunk.sha),
        );
        self.progress.inc(u64::from(job.chunk.cb_original));
        self.progress.set_message(job.file_key.clone());

        let file_done = {
            let mut progress = self.file_progress.lock().unwrap();
            let done = progress.entry(job.file_key.clone()).or_insert(0);
            *done += u64::from(job.chunk.cb_original);
            *done
        };
        debug!(
            file = %job.file_key,
            chunk = %chunk_hex,
            file_pct = (file_done as f64 / job.file_size as f64) * 100.0,
            total_pct = (self.progress.position() as f64 / self.total_size as f64) * 100.0,
            "chunk written"
        );
        Ok(())
    }

    /// One endpoint's worth of transport attempts
    async fn fetch(&self, url: &str) -> reqwest::Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(response) => return Ok(response),
                Err(err) if attempt < self.retry_num => {
                    attempt += 1;
                    debug!(error = %err, attempt, "retrying request");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Opens the target read+write, seeks to the chunk offset, and writes the
/// decoded payload. Spins while another process briefly holds the file.
fn write_at(path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    loop {
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(mut file) => {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(data)?;
                return Ok(());
            }
            Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                std::thread::sleep(WRITE_RETRY_PAUSE);
            }
            Err(err) => return Err(err),
        }
    }
}
