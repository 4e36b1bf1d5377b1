// ABOUTME: CLI entry point for campus-relay
// ABOUTME: Parses commands and wires change feeds, event bus and HTTP server together

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use campus_relay::auth::token_digest;
use campus_relay::config::{redact_url, Overrides, RelayConfig};
use campus_relay::{router, AppState, EventBus, Shutdown};
use clap::{Parser, Subcommand};
use table_watcher::sql::notify_trigger_sql;
use table_watcher::{ChangeSourceAdapter, PgNotifyFeed};

#[derive(Parser)]
#[command(name = "campus-relay")]
#[command(about = "Streams row changes from college tables to Server-Sent-Events clients", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay
    Serve {
        /// Path to relay.toml (defaults to ~/.campus-relay/relay.toml)
        #[arg(long, env = "CAMPUS_RELAY_CONFIG")]
        config: Option<PathBuf>,
        /// Address to listen on, e.g. 0.0.0.0:8080
        #[arg(long, env = "CAMPUS_RELAY_LISTEN")]
        listen: Option<SocketAddr>,
        /// PostgreSQL connection string for the change feeds
        #[arg(long, env = "CAMPUS_RELAY_DATABASE_URL", hide_env_values = true)]
        database_url: Option<String>,
    },
    /// Print the trigger DDL that makes watched tables emit notifications
    TriggerSql {
        #[arg(long, env = "CAMPUS_RELAY_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Print the SHA-256 digest of a token for [[auth.tokens]]
    HashToken { token: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Serve {
            config,
            listen,
            database_url,
        } => {
            let mut relay_config = RelayConfig::load(config.as_deref())?;
            relay_config.apply_overrides(Overrides {
                listen,
                database_url,
            });
            relay_config.validate()?;
            serve(relay_config).await
        }
        Commands::TriggerSql { config } => {
            let relay_config = RelayConfig::load(config.as_deref())?;
            relay_config.validate()?;
            print!(
                "{}",
                notify_trigger_sql(
                    &relay_config.source.schema,
                    &relay_config.source.channel_prefix,
                    relay_config.watched_tables()?,
                )
            );
            Ok(())
        }
        Commands::HashToken { token } => {
            println!("{}", token_digest(&token));
            Ok(())
        }
    }
}

async fn serve(config: RelayConfig) -> anyhow::Result<()> {
    let database_url = config.database_url()?.to_string();
    let watched = config.watched_tables()?;
    let authenticator = config.authenticator()?;
    if authenticator.is_empty() {
        tracing::warn!("No auth tokens configured; every stream request will be rejected");
    }

    tracing::info!(
        database = %redact_url(&database_url),
        tables = %watched,
        channel_prefix = %config.source.channel_prefix,
        tls = config.source.tls,
        "Starting change feeds"
    );

    let shutdown = Shutdown::new();
    shutdown.listen_for_ctrl_c();

    let bus = EventBus::new(config.stream.inbox_capacity);
    let feed = PgNotifyFeed::new(database_url, config.source.channel_prefix.clone())
        .with_tls(config.source.tls);
    let adapter = ChangeSourceAdapter::new(feed, config.adapter_config());
    for table in watched.iter() {
        let bus = Arc::clone(&bus);
        adapter.start(table, move |event| {
            bus.publish(event);
        });
    }

    let state = AppState {
        bus: Arc::clone(&bus),
        authenticator: Arc::new(authenticator),
        watched,
        heartbeat_interval: config.heartbeat_interval(),
        shutdown: shutdown.clone(),
        feeds: adapter.status(),
    };

    let listener = tokio::net::TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen))?;
    tracing::info!(listen = %config.server.listen, "Relay listening");

    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { server_shutdown.wait().await })
        .await
        .context("HTTP server failed");

    // Sessions drain on the same signal; make sure it has fired before
    // stopping the feeds.
    shutdown.trigger();
    adapter.stop_all().await;

    let metrics = bus.metrics();
    tracing::info!(
        published = metrics.published,
        delivered = metrics.delivered,
        dropped = metrics.dropped,
        "Relay stopped"
    );
    served
}
