//! Example: open one feed against a running backend and print every change.
//!
//! Usage: cargo run -p feed --example feed_watch -- --api-url http://localhost:3001 \
//!            --email admin@example.com --password secret notifications

use clap::{Parser, Subcommand};
use feed::{
    ApiClient, Chat, ClientConfig, FeedHandle, FeedKind, FeedSignal, FileTokenStore, Notifications,
    Session, SignupRequests, TokenStore,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Watch a realtime admin feed")]
struct Args {
    /// HTTP base URL of the backend.
    #[arg(long, env = "FEED_API_URL", default_value = "http://localhost:3001")]
    api_url: String,
    /// Socket.IO base URL; derived from the API URL when omitted.
    #[arg(long, env = "FEED_SOCKET_URL")]
    socket_url: Option<String>,
    #[arg(long, env = "FEED_TOKEN")]
    token: Option<String>,
    /// Where the token is kept between runs.
    #[arg(long, default_value = ".feed-token")]
    token_file: PathBuf,
    #[arg(long)]
    email: Option<String>,
    #[arg(long, env = "FEED_PASSWORD")]
    password: Option<String>,
    /// Roll back unconfirmed actions after this many seconds.
    #[arg(long)]
    pending_timeout: Option<u64>,
    #[command(subcommand)]
    feed: Feed,
}

#[derive(Subcommand)]
enum Feed {
    Chat { product_key: String },
    Notifications,
    Signups,
}

async fn session(args: &Args, config: &ClientConfig) -> anyhow::Result<Session> {
    let store = FileTokenStore::new(&args.token_file);
    if let Some(token) = &args.token {
        store.set(token);
    } else if let (Some(email), Some(password)) = (&args.email, &args.password) {
        let api = ApiClient::new(&config.api_url, config.request_timeout)?;
        let signed_in = api.sign_in(email, password).await?;
        store.set(&signed_in.token);
    }
    Ok(Session::restore(&store)?)
}

async fn watch<K: FeedKind>(kind: K, session: Session, config: &ClientConfig, store: FileTokenStore) -> anyhow::Result<()> {
    let mut handle = FeedHandle::open(kind, session, config)?;
    let mut signals = handle.signals();
    let mut view = handle.watch();
    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let v = view.borrow_and_update().clone();
                println!(
                    "status={:?} loading={} items={}",
                    v.connection_status,
                    v.loading,
                    v.items.len()
                );
                for item in &v.items {
                    println!("  {} {}", item.id, serde_json::to_string(&item.payload)?);
                }
            }
            signal = signals.recv() => match signal {
                Ok(FeedSignal::SessionInvalid { reason }) => {
                    eprintln!("session invalid: {reason}; sign in again");
                    store.clear();
                    break;
                }
                Ok(FeedSignal::NewItem) => println!("\x07new item"),
                Ok(FeedSignal::Notice(notice)) => eprintln!("[{:?}] {}", notice.level, notice.message),
                Err(e) => tracing::debug!(reason = %e, "signal stream lagged"),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    handle.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("feed=info".parse()?))
        .init();
    let args = Args::parse();

    let mut config = ClientConfig::new(&args.api_url);
    if let Some(url) = &args.socket_url {
        config = config.with_socket_url(url);
    }
    if let Some(secs) = args.pending_timeout {
        config = config.with_pending_timeout(Duration::from_secs(secs));
    }
    let session = session(&args, &config).await?;
    tracing::info!(subject = session.subject(), "session restored");

    let store = FileTokenStore::new(&args.token_file);
    match &args.feed {
        Feed::Chat { product_key } => watch(Chat::new(product_key), session, &config, store).await,
        Feed::Notifications => watch(Notifications, session, &config, store).await,
        Feed::Signups => watch(SignupRequests, session, &config, store).await,
    }
}
