/*!
The rotating pool of CDN endpoints workers draw from.

The pool is an ordered ring: `acquire` hands out the head, optionally
rotating it to the tail first, and lazily fills the ring from the content
server directory the first time it is consulted. In authenticated mode the
pool also keeps every endpoint's auth token fresh, refreshing synchronously
when a token is about to expire and in the background when it merely will
expire soon.
*/

use crate::session::{unix_now, ContentServer, SessionError, SessionHandle};

use thiserror::Error;
use tracing::{info, warn};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Tokens with less than this many seconds left are refreshed before use
const SYNC_REFRESH_WINDOW: u64 = 60;
/// Tokens with less than this many seconds left get a background refresh
const BACKGROUND_REFRESH_WINDOW: u64 = 300;

/// Error for the endpoint pool
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("no content servers available")]
    NoServers,
    #[error("no endpoint has a valid cdn auth token")]
    NoValidToken,
    #[error(transparent)]
    Session(#[from] SessionError),
}

type Result<T> = std::result::Result<T, PoolError>;

/// Ring of CDN endpoint base URLs, shared by every worker of an engine
pub struct ServerPool {
    depot_id: u32,
    ring: Mutex<VecDeque<String>>,
    session: Arc<SessionHandle>,
    /// Whether endpoints need auth tokens appended to chunk URLs
    authenticated: bool,
}

impl ServerPool {
    pub fn new(depot_id: u32, session: Arc<SessionHandle>, authenticated: bool) -> ServerPool {
        ServerPool {
            depot_id,
            ring: Mutex::new(VecDeque::new()),
            session,
            authenticated,
        }
    }

    /// Appends endpoints not already in the ring, fetching a token for
    /// each new one in authenticated mode
    pub async fn add<I>(&self, endpoints: I)
    where
        I: IntoIterator<Item = String>,
    {
        let fresh: Vec<String> = {
            let mut ring = self.ring.lock().unwrap();
            let mut fresh = Vec::new();
            for endpoint in endpoints {
                if !ring.contains(&endpoint) {
                    ring.push_back(endpoint.clone());
                    fresh.push(endpoint);
                }
            }
            fresh
        };
        for endpoint in fresh {
            info!("added content server {}", endpoint);
            if self.authenticated && self.session.token(&endpoint).is_none() {
                if let Err(err) = self.session.update_cdn_token(self.depot_id, &endpoint).await {
                    warn!(%endpoint, error = %err, "could not fetch a cdn auth token");
                }
            }
        }
    }

    /// Fills the ring from the directory if it is empty.
    ///
    /// `OpenCache` entries are dropped and `CDN` entries are moved to the
    /// front, keeping the directory's order otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NoServers`] when the directory has nothing to
    /// offer either.
    pub async fn ensure_servers(&self) -> Result<()> {
        if !self.ring.lock().unwrap().is_empty() {
            return Ok(());
        }
        info!("fetching content servers from the steam directory");
        let mut servers = self.session.content_servers().await?;
        servers.retain(|server| server.server_type != "OpenCache");
        servers.sort_by_key(|server| server.server_type != "CDN");
        self.add(servers.iter().map(ContentServer::base_url)).await;

        if self.ring.lock().unwrap().is_empty() {
            return Err(PoolError::NoServers);
        }
        Ok(())
    }

    /// Hands out the endpoint at the head of the ring together with the
    /// token string to append to chunk URLs (empty in anonymous mode).
    ///
    /// With `rotate` the head is first moved to the tail, so a worker that
    /// had a bad experience gets the next endpoint over.
    pub async fn acquire(&self, rotate: bool) -> Result<(String, String)> {
        self.ensure_servers().await?;
        let endpoint = {
            let mut ring = self.ring.lock().unwrap();
            if rotate && ring.len() > 1 {
                ring.rotate_left(1);
            }
            ring.front().cloned().ok_or(PoolError::NoServers)?
        };

        if !self.authenticated {
            return Ok((endpoint, String::new()));
        }

        let token = match self.session.token(&endpoint) {
            Some(token) => token,
            None => {
                self.session
                    .update_cdn_token(self.depot_id, &endpoint)
                    .await?
            }
        };

        let now = unix_now();
        match token.expires_in(now) {
            // Sentinel tokens never expire
            None => Ok((endpoint, token.token)),
            Some(left) if left < SYNC_REFRESH_WINDOW => {
                match self.session.update_cdn_token(self.depot_id, &endpoint).await {
                    Ok(fresh) => Ok((endpoint, fresh.token)),
                    Err(err) => {
                        warn!(
                            %endpoint,
                            error = %err,
                            "token refresh failed, falling back to another endpoint"
                        );
                        self.session
                            .any_valid_token(now, SYNC_REFRESH_WINDOW)
                            .map(|(endpoint, token)| (endpoint, token.token))
                            .ok_or(PoolError::NoValidToken)
                    }
                }
            }
            Some(left) if left < BACKGROUND_REFRESH_WINDOW => {
                Arc::clone(&self.session).refresh_in_background(self.depot_id, &endpoint);
                Ok((endpoint, token.token))
            }
            Some(_) => Ok((endpoint, token.token)),
        }
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().unwrap().is_empty()
    }
}
