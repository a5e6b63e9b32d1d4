use depotdl::session::{CdnToken, ContentServer, SessionError, SessionHandle, SteamSession};
use depotdl_core::crypto::{self, DepotKey};
use depotdl_core::manifest::{ChunkRecord, DepotManifest, FileMapping};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use xz2::stream::{Action, Filters, LzmaOptions, Status, Stream};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[allow(dead_code)]
pub fn test_key() -> DepotKey {
    DepotKey::from_hex("00112233445566778899aabbccddeeff").unwrap()
}

#[allow(dead_code)]
pub fn sha_bytes(fill: u8) -> [u8; 20] {
    [fill; 20]
}

#[allow(dead_code)]
pub fn chunk_path(depot_id: u32, sha: &[u8; 20]) -> String {
    format!("/depot/{}/chunk/{}", depot_id, hex::encode(sha))
}

/// A manifest with a single regular file made of the given
/// `(offset, sha, cb_original)` chunks
#[allow(dead_code)]
pub fn single_file_manifest(
    depot_id: u32,
    filename: &str,
    size: u64,
    chunks: Vec<(u64, [u8; 20], u32)>,
) -> DepotManifest {
    DepotManifest {
        depot_id,
        total_size: size,
        mappings: vec![FileMapping {
            filename: filename.to_string(),
            size,
            flags: 0,
            chunks: chunks
                .into_iter()
                .map(|(offset, sha, cb_original)| ChunkRecord {
                    sha,
                    offset,
                    cb_original,
                })
                .collect(),
        }],
    }
}

fn compress_lzma1(data: &[u8]) -> Vec<u8> {
    let options = LzmaOptions::new_preset(6).unwrap();
    let mut filters = Filters::new();
    filters.lzma1(&options);
    let mut stream = Stream::new_raw_encoder(&filters).unwrap();

    let mut out = Vec::with_capacity(data.len() + 128);
    let mut consumed = 0;
    while consumed < data.len() {
        if out.len() == out.capacity() {
            out.reserve(1024);
        }
        stream
            .process_vec(&data[consumed..], &mut out, Action::Run)
            .unwrap();
        consumed = stream.total_in() as usize;
    }
    loop {
        if out.len() == out.capacity() {
            out.reserve(1024);
        }
        let status = stream.process_vec(&[], &mut out, Action::Finish).unwrap();
        if matches!(status, Status::StreamEnd) {
            break;
        }
    }
    out
}

/// An encrypted chunk in the VZ container, as the CDN would serve it
#[allow(dead_code)]
pub fn vz_chunk(payload: &[u8], key: &DepotKey) -> Vec<u8> {
    let body = compress_lzma1(payload);
    let mut container = Vec::with_capacity(body.len() + 22);
    container.extend_from_slice(b"VZa");
    container.extend_from_slice(&[0_u8; 4]);
    container.push(93);
    container.extend_from_slice(&(8_u32 * 1024 * 1024).to_le_bytes());
    container.extend_from_slice(&body);
    container.extend_from_slice(&crc32fast_hash(payload).to_le_bytes());
    container.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    container.extend_from_slice(b"zv");
    crypto::encrypt(&container, key)
}

/// An encrypted chunk packed as a single entry zip archive
#[allow(dead_code)]
pub fn zip_chunk(payload: &[u8], key: &DepotKey) -> Vec<u8> {
    use std::io::Write;
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    writer.start_file("0", options).unwrap();
    writer.write_all(payload).unwrap();
    let archive = writer.finish().unwrap().into_inner();
    crypto::encrypt(&archive, key)
}

fn crc32fast_hash(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// A local stand-in for a CDN endpoint: serves canned chunk blobs and
/// counts every request it sees
pub struct ChunkServer {
    pub base_url: String,
    pub hits: Arc<AtomicUsize>,
    /// Full request targets (path + query) in arrival order
    pub requests: Arc<Mutex<Vec<String>>>,
}

#[allow(dead_code)]
pub async fn spawn_chunk_server(chunks: HashMap<String, Vec<u8>>) -> ChunkServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));
    let chunks = Arc::new(chunks);

    {
        let hits = Arc::clone(&hits);
        let requests = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                };
                let hits = Arc::clone(&hits);
                let requests = Arc::clone(&requests);
                let chunks = Arc::clone(&chunks);
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buffer = [0_u8; 1024];
                    loop {
                        let read = match socket.read(&mut buffer).await {
                            Ok(0) | Err(_) => return,
                            Ok(read) => read,
                        };
                        request.extend_from_slice(&buffer[..read]);
                        if request.windows(4).any(|window| window == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let request = String::from_utf8_lossy(&request);
                    let target = request
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or_default()
                        .to_string();
                    hits.fetch_add(1, Ordering::SeqCst);
                    requests.lock().unwrap().push(target.clone());

                    // Auth tokens ride in the query string and do not
                    // change which chunk is addressed
                    let path = target.split('?').next().unwrap_or_default();
                    let response = match chunks.get(path) {
                        Some(body) => {
                            let mut response = format!(
                                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                                body.len()
                            )
                            .into_bytes();
                            response.extend_from_slice(body);
                            response
                        }
                        None => {
                            b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                                .to_vec()
                        }
                    };
                    let _ = socket.write_all(&response).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
    }

    ChunkServer {
        base_url: format!("http://127.0.0.1:{}", addr.port()),
        hits,
        requests,
    }
}

/// Session double for anonymous runs: the directory is never consulted
/// because tests seed the pool with the local server
pub struct NullSession;

#[async_trait]
impl SteamSession for NullSession {
    async fn content_servers(&self) -> Result<Vec<ContentServer>, SessionError> {
        Ok(Vec::new())
    }

    async fn cdn_auth_token(&self, _depot_id: u32, hostname: &str) -> Result<CdnToken, SessionError> {
        Err(SessionError::TokensUnsupported(hostname.to_string()))
    }

    async fn anonymous_login(&self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

#[allow(dead_code)]
pub fn null_session() -> Arc<SessionHandle> {
    SessionHandle::new(Arc::new(NullSession))
}

/// Session double that issues tokens with scripted lifetimes
pub struct TokenSession {
    lifetimes: Mutex<Vec<u64>>,
    pub issued: AtomicUsize,
}

#[allow(dead_code)]
impl TokenSession {
    pub fn new(lifetimes: &[u64]) -> Arc<TokenSession> {
        let mut remaining: Vec<u64> = lifetimes.to_vec();
        remaining.reverse();
        Arc::new(TokenSession {
            lifetimes: Mutex::new(remaining),
            issued: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SteamSession for TokenSession {
    async fn content_servers(&self) -> Result<Vec<ContentServer>, SessionError> {
        Ok(Vec::new())
    }

    async fn cdn_auth_token(&self, _depot_id: u32, _hostname: &str) -> Result<CdnToken, SessionError> {
        let lifetime = self.lifetimes.lock().unwrap().pop().unwrap_or(3600);
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        Ok(CdnToken {
            token: format!("?auth{}", n),
            expiration_time: now + lifetime,
        })
    }

    async fn anonymous_login(&self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), SessionError> {
        Ok(())
    }
}
