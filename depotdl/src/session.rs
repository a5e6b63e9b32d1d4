/*!
The Steam side of a download: the content server directory and the CDN
auth tokens that some endpoints require.

Both live behind the [`SteamSession`] trait. [`WebApiSession`] implements
the directory half over the public web API and the tokenless
`steamcontent.com` path; a full CM login client slots in behind the same
trait. [`SessionHandle`] carries the per-run shared state: one token map
and one single-flight refresh flag, shared by every engine of the run.
*/

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Hosts under this suffix serve chunks without any auth token
const TOKENLESS_HOST_SUFFIX: &str = ".steamcontent.com";

/// Attempts at fetching a token before giving up, with a session
/// reconnect between attempts
const TOKEN_FETCH_RETRIES: u32 = 3;

const DIRECTORY_URL: &str =
    "https://api.steampowered.com/IContentServerDirectoryService/GetServersForSteamPipe/v1/?cell_id=0";

/// Error for the login and directory collaborators
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("login failure: {0}")]
    LoginFailure(String),
    #[error("endpoint {0:?} has no parseable hostname")]
    BadEndpoint(String),
    #[error("content server directory request failed")]
    Directory(#[from] reqwest::Error),
    #[error("this session cannot issue cdn auth tokens for {0:?}")]
    TokensUnsupported(String),
}

type Result<T> = std::result::Result<T, SessionError>;

/// A content server as reported by the directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentServer {
    /// Directory class of the endpoint, e.g. `CDN` or `SteamCache`
    pub server_type: String,
    pub https: bool,
    pub host: String,
    pub port: u16,
}

impl ContentServer {
    /// The endpoint as a `scheme://host:port` base URL
    pub fn base_url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// A CDN auth token for one endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CdnToken {
    /// Opaque token string, concatenated verbatim onto chunk URLs
    /// (including its own leading `?` when the issuer requires one)
    pub token: String,
    /// Expiration in epoch seconds; `0` means the token never expires
    pub expiration_time: u64,
}

impl CdnToken {
    /// The empty, never-expiring token used for tokenless hosts
    pub fn sentinel() -> CdnToken {
        CdnToken {
            token: String::new(),
            expiration_time: 0,
        }
    }

    /// Seconds until expiry, or `None` for tokens that never expire
    pub fn expires_in(&self, now: u64) -> Option<u64> {
        if self.expiration_time == 0 {
            None
        } else {
            Some(self.expiration_time.saturating_sub(now))
        }
    }
}

/// The current time in epoch seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Directory lookups and token issuance, the two things the engine needs
/// from a Steam session.
#[async_trait]
pub trait SteamSession: Send + Sync {
    /// The current list of content servers
    async fn content_servers(&self) -> Result<Vec<ContentServer>>;

    /// Issues a CDN auth token for downloading `depot_id` from `hostname`
    async fn cdn_auth_token(&self, depot_id: u32, hostname: &str) -> Result<CdnToken>;

    async fn anonymous_login(&self) -> Result<()>;

    async fn reconnect(&self) -> Result<()>;
}

/// Shared session state for one run.
///
/// Owns the endpoint to token map and the single-flight refresh flag, so
/// several depot engines in one run reuse each other's tokens instead of
/// each keeping their own.
pub struct SessionHandle {
    session: Arc<dyn SteamSession>,
    tokens: Mutex<HashMap<String, CdnToken>>,
    refreshing: AtomicBool,
}

impl SessionHandle {
    pub fn new(session: Arc<dyn SteamSession>) -> Arc<SessionHandle> {
        Arc::new(SessionHandle {
            session,
            tokens: Mutex::new(HashMap::new()),
            refreshing: AtomicBool::new(false),
        })
    }

    pub async fn content_servers(&self) -> Result<Vec<ContentServer>> {
        self.session.content_servers().await
    }

    /// The cached token for an endpoint, if one has been fetched
    pub fn token(&self, endpoint: &str) -> Option<CdnToken> {
        self.tokens.lock().unwrap().get(endpoint).cloned()
    }

    /// Any endpoint whose cached token still has at least `min_left`
    /// seconds on it
    pub fn any_valid_token(&self, now: u64, min_left: u64) -> Option<(String, CdnToken)> {
        self.tokens
            .lock()
            .unwrap()
            .iter()
            .find(|(_, token)| token.expires_in(now).map_or(true, |left| left >= min_left))
            .map(|(endpoint, token)| (endpoint.clone(), token.clone()))
    }

    /// Fetches a fresh token for an endpoint and installs it in the map.
    ///
    /// Hosts under `steamcontent.com` get the sentinel without a round
    /// trip. Everything else goes through the session, retrying up to
    /// three times with a reconnect and fresh anonymous login between
    /// attempts.
    pub async fn update_cdn_token(&self, depot_id: u32, endpoint: &str) -> Result<CdnToken> {
        let host = Url::parse(endpoint)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .ok_or_else(|| SessionError::BadEndpoint(endpoint.to_string()))?;

        let token = if host.ends_with(TOKENLESS_HOST_SUFFIX) {
            CdnToken::sentinel()
        } else {
            let mut retries_left = TOKEN_FETCH_RETRIES;
            loop {
                match self.session.cdn_auth_token(depot_id, &host).await {
                    Ok(token) => break token,
                    Err(err) if retries_left > 0 => {
                        retries_left -= 1;
                        warn!(%endpoint, error = %err, "token fetch failed, reconnecting");
                        let _ = self.session.reconnect().await;
                        let _ = self.session.anonymous_login().await;
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        debug!(
            %endpoint,
            expiration = token.expiration_time,
            "updated cdn auth token"
        );
        self.tokens
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), token.clone());
        Ok(token)
    }

    /// Kicks off a background token refresh for an endpoint, unless one is
    /// already in flight anywhere in the run
    pub fn refresh_in_background(self: Arc<Self>, depot_id: u32, endpoint: &str) {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let handle = self;
            let endpoint = endpoint.to_string();
            tokio::spawn(async move {
                if let Err(err) = handle.update_cdn_token(depot_id, &endpoint).await {
                    warn!(%endpoint, error = %err, "background token refresh failed");
                }
                handle.refreshing.store(false, Ordering::SeqCst);
            });
        }
    }
}

/// The session the CLI runs with: the public content server directory,
/// plus the tokenless `steamcontent.com` path.
///
/// Issuing real CDN auth tokens requires a CM login, which lives outside
/// this crate; sessions that have one implement [`SteamSession`] over it.
pub struct WebApiSession {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct DirectoryEnvelope {
    response: DirectoryResponse,
}

#[derive(Deserialize, Default)]
struct DirectoryResponse {
    #[serde(default)]
    servers: Vec<DirectoryServer>,
}

#[derive(Deserialize)]
struct DirectoryServer {
    #[serde(rename = "type")]
    server_type: String,
    host: String,
    #[serde(default)]
    https_support: String,
    #[serde(default)]
    port: Option<u16>,
}

impl WebApiSession {
    pub fn new() -> Result<WebApiSession> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(WebApiSession { client })
    }
}

#[async_trait]
impl SteamSession for WebApiSession {
    async fn content_servers(&self) -> Result<Vec<ContentServer>> {
        let envelope: DirectoryEnvelope = self
            .client
            .get(DIRECTORY_URL)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope
            .response
            .servers
            .into_iter()
            .map(|server| {
                let https = server.https_support != "none";
                ContentServer {
                    server_type: server.server_type,
                    https,
                    port: server.port.unwrap_or(if https { 443 } else { 80 }),
                    host: server.host,
                }
            })
            .collect())
    }

    async fn cdn_auth_token(&self, _depot_id: u32, hostname: &str) -> Result<CdnToken> {
        if hostname.ends_with(TOKENLESS_HOST_SUFFIX) {
            Ok(CdnToken::sentinel())
        } else {
            Err(SessionError::TokensUnsupported(hostname.to_string()))
        }
    }

    async fn anonymous_login(&self) -> Result<()> {
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        Ok(())
    }
}
