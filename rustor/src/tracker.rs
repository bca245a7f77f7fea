use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use bytes::Buf;
use url::Url;
use crate::ID;

type Result<T> = std::result::Result<T, TrackerError>;

// Retry schedule after a failed announce: doubles from the floor to the cap.
pub const INITIAL_RETRY: Duration = Duration::from_secs(5);
pub const MAX_RETRY: Duration = Duration::from_secs(3600);

// Step added to numwant when the returned peer list runs dry.
pub const NUMWANT_STEP: u32 = 50;

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("error decoding response: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("response carries failure reason: {0}")]
    Failure(String),

    #[error("malformed peer list: {0}")]
    MalformedPeers(&'static str),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrackerEvent {
    Started,
    Stopped,
    Completed,
}

impl std::fmt::Display for TrackerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerEvent::Started => write!(f, "started"),
            TrackerEvent::Stopped => write!(f, "stopped"),
            TrackerEvent::Completed => write!(f, "completed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceParams {

    pub info_hash: ID,

    pub peer_id: ID,

    // Port we accept connections on.
    pub port: u16,

    pub uploaded: u64,

    pub downloaded: u64,

    // Bytes still needed for a complete package.
    pub left: u64,

    pub event: Option<TrackerEvent>,

    pub numwant: u32,

    // Optional externally visible address.
    pub ip: Option<String>,

}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {

    // Seconds to wait between refreshes, floored at zero.
    pub interval: Duration,

    pub complete: Option<u64>,

    pub incomplete: Option<u64>,

    pub peers: Vec<SocketAddr>,

}

/// One tracker endpoint plus the peer list it last gave us.
#[derive(Debug)]
pub struct TrackerConnection {

    pub url: Url,

    client: reqwest::Client,

    pub interval: Duration,

    pub last_announce: Option<Instant>,

    pub peers: Vec<SocketAddr>,

    // Addresses we have attempted, successfully or not.
    pub tried: HashSet<SocketAddr>,

    pub numwant: u32,

}

impl TrackerConnection {

    pub fn new(url: Url, numwant: u32) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
            interval: Duration::from_secs(0),
            last_announce: None,
            peers: Vec::new(),
            tried: HashSet::new(),
            numwant,
        }
    }

    /// Announce with `compact=1`; a tracker that answers with something we
    /// cannot parse gets one more chance at `compact=0`.
    pub async fn announce(&mut self, params: &AnnounceParams) -> Result<AnnounceResponse> {
        let response = match self.request(params, true).await {
            Ok(response) => response,
            Err(TrackerError::BencodeError(_)) | Err(TrackerError::MalformedPeers(_)) => {
                tracing::warn!(url = %self.url, "compact response unparsable, retrying with compact=0");
                self.request(params, false).await?
            }
            Err(e) => return Err(e),
        };

        self.interval = response.interval;
        self.last_announce = Some(Instant::now());
        self.peers = response.peers.clone();
        tracing::info!(
            url = %self.url,
            peers = response.peers.len(),
            interval = response.interval.as_secs(),
            "announce ok",
        );
        Ok(response)
    }

    async fn request(&self, params: &AnnounceParams, compact: bool) -> Result<AnnounceResponse> {
        let url = self.build_url(params, compact);
        tracing::debug!("announce url: {}", url);
        let raw = self.client.get(url).send().await?.bytes().await?;
        parse_response(&raw)
    }

    fn build_url(&self, params: &AnnounceParams, compact: bool) -> String {
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&numwant={}&compact={}",
            self.url.as_str(),
            urlencoding::encode_binary(&params.info_hash),
            urlencoding::encode_binary(&params.peer_id),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
            params.numwant,
            if compact { 1 } else { 0 },
        );
        if let Some(event) = params.event {
            url.push_str(&format!("&event={}", event));
        }
        if let Some(ip) = &params.ip {
            url.push_str(&format!("&ip={}", ip));
        }
        url
    }

    pub fn due_for_refresh(&self, now: Instant) -> bool {
        match self.last_announce {
            Some(at) => now.duration_since(at) >= self.interval,
            None => true,
        }
    }

    /// Every peer the tracker offered has been attempted.
    pub fn exhausted(&self) -> bool {
        self.peers.iter().all(|p| self.tried.contains(p))
    }

    pub fn mark_tried(&mut self, addr: SocketAddr) {
        self.tried.insert(addr);
    }
}

fn parse_response(raw: &[u8]) -> Result<AnnounceResponse> {

    let root = bencode::decode(raw)?;

    if let Some(reason) = root.get_str("failure reason")? {
        return Err(TrackerError::Failure(reason.to_string()));
    }

    let interval = root.get_int("interval")?.unwrap_or(0).max(0) as u64;
    let complete = root.get_int("complete")?.map(|n| n.max(0) as u64);
    let incomplete = root.get_int("incomplete")?.map(|n| n.max(0) as u64);

    let peers = match root.get("peers")? {
        // Compact model: 6-byte records, 4-byte IPv4 then 2-byte port,
        // network byte order.
        Some(bencode::Value::Bytes(bytes)) => {
            if bytes.len() % 6 != 0 {
                return Err(TrackerError::MalformedPeers("peer string not a multiple of 6"));
            }
            let mut v = &bytes[..];
            let mut peers = Vec::with_capacity(bytes.len() / 6);
            while v.has_remaining() {
                peers.push(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(v.get_u32())),
                    v.get_u16(),
                ));
            }
            peers
        }
        // Dictionary model: a list of {peer id?, ip, port}.
        Some(bencode::Value::List(entries)) => {
            let mut peers = Vec::with_capacity(entries.len());
            for entry in entries {
                let ip = entry.require_str("ip")?;
                let port = entry.require_int("port")?;
                if !(0..=u16::MAX as i64).contains(&port) {
                    return Err(TrackerError::MalformedPeers("port out of range"));
                }
                match ip.parse::<IpAddr>() {
                    Ok(ip) => peers.push(SocketAddr::new(ip, port as u16)),
                    Err(_) => {
                        // Hostname entries are legal but unresolvable here.
                        tracing::warn!("skipping unparsable peer address: {}", ip);
                    }
                }
            }
            peers
        }
        Some(_) => return Err(TrackerError::MalformedPeers("peers is neither string nor list")),
        None => Vec::new(),
    };

    Ok(AnnounceResponse {
        interval: Duration::from_secs(interval),
        complete,
        incomplete,
        peers,
    })
}

/// Exponential retry schedule for a lost tracker.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    delay: Duration,
}

impl Backoff {

    pub fn new() -> Self {
        Self { delay: INITIAL_RETRY }
    }

    /// The delay to wait now; doubles for next time, capped.
    pub fn next(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (self.delay * 2).min(MAX_RETRY);
        delay
    }

    pub fn reset(&mut self) {
        self.delay = INITIAL_RETRY;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
