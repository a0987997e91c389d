use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use ipnet::IpNet;
use tracing::warn;

use crate::RelayError;
use crate::store::Store;

const REFRESH_PERIOD: Duration = Duration::from_secs(60);

/// 进程级封禁名单快照，读路径无锁竞争（读写锁 + 整体替换）。
#[derive(Debug, Default)]
pub struct BanCache {
    inner: RwLock<BanSnapshot>,
}

#[derive(Debug, Default)]
struct BanSnapshot {
    ips: HashSet<String>,
    cidrs: Vec<IpNet>,
}

impl BanCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the snapshot from all active ban entries. The new sets are
    /// built completely before the swap, so readers never observe a
    /// half-updated list. Expired entries are skipped, not deleted.
    pub async fn refresh(&self, store: &Store) -> Result<(), RelayError> {
        let bans = store.list_ip_bans().await?;
        let now = Utc::now().timestamp();

        let mut ips = HashSet::new();
        let mut cidrs = Vec::new();
        for ban in bans {
            if let Some(expires_at) = ban.expires_at
                && expires_at > 0
                && expires_at < now
            {
                continue;
            }
            match ban.ip.parse::<IpNet>() {
                Ok(net) => cidrs.push(net),
                Err(_) => {
                    ips.insert(ban.ip);
                }
            }
        }

        let mut guard = self.inner.write().expect("ban snapshot lock");
        *guard = BanSnapshot { ips, cidrs };
        Ok(())
    }

    /// Literal match first, then CIDR containment. Unparseable input is
    /// never banned.
    pub fn is_banned(&self, ip: &str) -> bool {
        let snapshot = self.inner.read().expect("ban snapshot lock");
        if snapshot.ips.contains(ip) {
            return true;
        }
        match ip.parse::<IpAddr>() {
            Ok(addr) => snapshot.cidrs.iter().any(|net| net.contains(&addr)),
            Err(_) => false,
        }
    }

    /// Refresh every 60s for the lifetime of the process. On failure the
    /// stale snapshot is kept: a known-good ban list beats an empty one.
    pub fn spawn_refresher(self: Arc<Self>, store: Store) {
        let cache = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_PERIOD);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = cache.refresh(&store).await {
                    warn!("failed to refresh IP ban cache: {err}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::temp_store;

    #[tokio::test]
    async fn literal_and_cidr_bans_apply_after_refresh() {
        let store = temp_store("ban-basic").await;
        let cache = BanCache::new();

        store.insert_ip_ban("203.0.113.7", "abuse", None).await.unwrap();
        store.insert_ip_ban("10.0.0.0/8", "range", None).await.unwrap();

        // Nothing applies until a refresh publishes the snapshot.
        assert!(!cache.is_banned("203.0.113.7"));

        cache.refresh(&store).await.unwrap();
        assert!(cache.is_banned("203.0.113.7"));
        assert!(cache.is_banned("10.1.2.3"));
        assert!(!cache.is_banned("203.0.113.8"));
        assert!(!cache.is_banned("11.0.0.1"));
        assert!(!cache.is_banned("not an ip"));
    }

    #[tokio::test]
    async fn expired_entries_are_inactive() {
        let store = temp_store("ban-expiry").await;
        let cache = BanCache::new();

        let past = Utc::now().timestamp() - 60;
        let future = Utc::now().timestamp() + 3600;
        store.insert_ip_ban("198.51.100.1", "", Some(past)).await.unwrap();
        store.insert_ip_ban("198.51.100.2", "", Some(future)).await.unwrap();

        cache.refresh(&store).await.unwrap();
        assert!(!cache.is_banned("198.51.100.1"));
        assert!(cache.is_banned("198.51.100.2"));
    }

    #[tokio::test]
    async fn unban_takes_effect_on_next_refresh() {
        let store = temp_store("ban-remove").await;
        let cache = BanCache::new();

        let ban = store.insert_ip_ban("198.51.100.9", "", None).await.unwrap();
        cache.refresh(&store).await.unwrap();
        assert!(cache.is_banned("198.51.100.9"));

        store.delete_ip_ban(ban.id).await.unwrap();
        cache.refresh(&store).await.unwrap();
        assert!(!cache.is_banned("198.51.100.9"));
    }
}
