mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;
use tracing::warn;

use llm_relay::proxy::UpstreamConfig;
use llm_relay::{
    BanCache, LogPipeline, RateLimiter, RelayProxy, Store, parse_trusted_proxies,
};
use server::AppState;

#[derive(Debug, Parser)]
#[command(author, version, about = "Metered reverse proxy for a single LLM upstream")]
struct Cli {
    /// Address to bind the HTTP server to.
    #[arg(long, env = "RELAY_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Port to bind the HTTP server to.
    #[arg(long, env = "RELAY_PORT", default_value_t = 3000)]
    port: u16,

    /// SQLite database path holding accounts, tokens, bans, and usage logs.
    #[arg(long, env = "RELAY_DB_PATH", default_value = "relay.db")]
    db_path: String,

    /// Upstream base URL (origin only; request paths are forwarded as-is).
    #[arg(long, env = "RELAY_UPSTREAM_URL")]
    upstream_url: Option<String>,

    /// Credential injected into every upstream request.
    #[arg(long, env = "RELAY_UPSTREAM_KEY", hide_env_values = true)]
    upstream_key: Option<String>,

    /// Admin key compared against the X-Admin-Key header; unset disables the
    /// admin API entirely.
    #[arg(long, env = "RELAY_ADMIN_KEY", hide_env_values = true)]
    admin_key: Option<String>,

    /// Comma separated IPs/CIDRs whose forwarding headers are trusted for
    /// client IP resolution.
    #[arg(long, env = "TRUSTED_PROXIES", value_delimiter = ',')]
    trusted_proxies: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    let store = Store::new(&cli.db_path).await?;

    let bans = Arc::new(BanCache::new());
    if let Err(err) = bans.refresh(&store).await {
        warn!("initial IP ban refresh failed, starting with an empty list: {err}");
    }
    Arc::clone(&bans).spawn_refresher(store.clone());

    let limiter = Arc::new(RateLimiter::new());
    Arc::clone(&limiter).spawn_sweeper();

    let pipeline = LogPipeline::spawn(store.clone());
    let proxy = RelayProxy::new(
        store.clone(),
        pipeline,
        UpstreamConfig {
            url: cli.upstream_url,
            key: cli.upstream_key,
        },
    );

    let state = Arc::new(AppState {
        store,
        proxy,
        bans,
        limiter,
        admin_key: cli.admin_key,
        trusted_proxies: parse_trusted_proxies(&cli.trusted_proxies),
    });

    let addr: SocketAddr = format!("{}:{}", cli.bind, cli.port).parse()?;
    server::serve(addr, state).await
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("llm_relay=info,sqlx=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
