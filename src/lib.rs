use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use ipnet::IpNet;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod admission;
pub mod ban;
pub mod logging;
pub mod proxy;
pub mod rate_limit;
pub mod store;
pub mod usage;

pub use admission::{Admitted, RejectKind, Rejection};
pub use ban::BanCache;
pub use logging::LogPipeline;
pub use proxy::{RelayProxy, UpstreamConfig};
pub use rate_limit::RateLimiter;
pub use store::Store;

/// 下发给用户的 API key 统一前缀。
pub const KEY_PREFIX: &str = "sk-relay-";

/// 客户端 IP 解析时按序检查的代理头。
const PROXY_IP_HEADERS: &[&str] = &["cf-connecting-ip", "x-real-ip"];

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("account not found")]
    AccountNotFound,
    #[error("account token limit reached ({0})")]
    TokenLimitReached(i64),
}

/// 新生成的 API key：明文只在创建时返回一次，库里只存哈希。
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub plain: String,
    pub hash: String,
    pub prefix: String,
}

pub fn generate_api_key() -> GeneratedKey {
    let mut secret = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut secret);
    let hex = hex_encode(&secret);
    let plain = format!("{KEY_PREFIX}{hex}");
    let prefix = format!("{KEY_PREFIX}{}...{}", &hex[..4], &hex[hex.len() - 4..]);
    GeneratedKey {
        hash: hash_key(&plain),
        plain,
        prefix,
    }
}

pub fn hash_key(key: &str) -> String {
    hex_encode(&Sha256::digest(key.as_bytes()))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// 解析 TRUSTED_PROXIES 配置，单个 IP 当作 /32（IPv6 为 /128）。
pub fn parse_trusted_proxies<I, S>(entries: I) -> Vec<IpNet>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    entries
        .into_iter()
        .filter_map(|entry| {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                return None;
            }
            if entry.contains('/') {
                entry.parse::<IpNet>().ok()
            } else {
                entry.parse::<IpAddr>().ok().map(IpNet::from)
            }
        })
        .collect()
}

/// Resolve the client IP. Proxy headers are only honored when the immediate
/// peer is inside the trusted proxy set; otherwise the socket address wins.
pub fn resolve_client_ip(peer: SocketAddr, headers: &HeaderMap, trusted: &[IpNet]) -> String {
    let peer_ip = peer.ip();
    if !trusted.iter().any(|net| net.contains(&peer_ip)) {
        return peer_ip.to_string();
    }

    for name in PROXY_IP_HEADERS {
        if let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok())
            && let Ok(addr) = value.trim().parse::<IpAddr>()
        {
            return addr.to_string();
        }
    }

    // X-Forwarded-For: first entry that parses as an address wins.
    if let Some(raw) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        for part in raw.split(',') {
            if let Ok(addr) = part.trim().parse::<IpAddr>() {
                return addr.to_string();
            }
        }
    }

    peer_ip.to_string()
}

/// Test an IP against a single allow-list entry: CIDR containment when the
/// entry carries a prefix, literal equality otherwise. Unparseable input
/// never matches.
pub fn ip_matches(ip: &str, entry: &str) -> bool {
    if entry.contains('/') {
        return match (entry.parse::<IpNet>(), ip.parse::<IpAddr>()) {
            (Ok(net), Ok(addr)) => net.contains(&addr),
            _ => false,
        };
    }
    match (ip.parse::<IpAddr>(), entry.parse::<IpAddr>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => ip == entry,
    }
}
