use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use rand::distributions::Alphanumeric;
use secrecy::ExposeSecret;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use pipeboard::channels::web::server::{GatewayState, RateLimiter, start_server};
use pipeboard::config::Config;
use pipeboard::crm::TeamleaderClient;
use pipeboard::directory::GraphClient;
use pipeboard::mail::mailer_from_config;
use pipeboard::oauth::{CrmOAuth, TokenStore};
use pipeboard::pipeline::{Board, BoardHandle, BoardRules, BoardService};

const GENERATED_TOKEN_LEN: usize = 32;

#[derive(Debug, Parser)]
#[command(name = "pipeboard", version, about = "Sales pipeline board backend")]
struct Cli {
    /// TOML settings file; environment variables override its values.
    #[arg(long, env = "PIPEBOARD_CONFIG")]
    config: Option<PathBuf>,

    /// Address to serve the board API on.
    #[arg(long)]
    bind: Option<SocketAddr>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pipeboard=info,tower_http=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing();

    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = cli.bind {
        config.gateway.bind = bind;
    }

    let store = pipeboard::db::connect_from_config(&config.store)
        .await
        .context("opening the document store")?;

    let oauth = Arc::new(CrmOAuth::new(&config.crm, Arc::new(TokenStore::new())));
    let crm = Arc::new(TeamleaderClient::new(
        &config.crm.api_url,
        oauth.clone(),
        config.crm.page_size,
    ));
    let directory = Arc::new(GraphClient::new(&config.directory));

    let rules = BoardRules {
        phases: config.crm.phases.clone(),
        grouping_field_id: config.crm.grouping_field_id.clone(),
        assignee_field_id: config.crm.assignee_field_id.clone(),
    };
    let board = BoardHandle::spawn(Board::new(rules.clone()));
    let service = Arc::new(BoardService::new(board, crm, directory, store, rules));

    if let Err(e) = service.refresh_employees().await {
        tracing::warn!("Initial employee load failed: {}", e);
    }
    tracing::info!(
        "Sign in to Teamleader at http://{}/auth/teamleader/login to load deals",
        config.gateway.bind
    );

    let mailer = mailer_from_config(&config.mail).context("configuring the mail relay")?;

    let auth_token = match &config.gateway.auth_token {
        Some(token) => token.expose_secret().to_string(),
        None => {
            let token: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(GENERATED_TOKEN_LEN)
                .map(char::from)
                .collect();
            tracing::warn!("GATEWAY_AUTH_TOKEN unset, generated token for this run: {}", token);
            token
        }
    };

    let state = Arc::new(GatewayState {
        service,
        oauth: Some(oauth),
        mailer,
        bug_report_limiter: RateLimiter::new(
            config.gateway.bug_report_limit,
            config.gateway.bug_report_window_secs,
        ),
        shutdown_tx: tokio::sync::RwLock::new(None),
        startup_time: std::time::Instant::now(),
    });

    start_server(config.gateway.bind, state.clone(), auth_token)
        .await
        .context("starting the gateway")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    if let Some(tx) = state.shutdown_tx.write().await.take() {
        let _ = tx.send(());
    }
    Ok(())
}
