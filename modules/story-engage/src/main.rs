use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use browser_session::{BrowserSession, CdpSession};
use engage_common::Config;
use story_api_client::{ApiClient, SessionCredentials};
use story_engage::analysis::HttpAnalysisClient;
use story_engage::executor::VerifyConfig;
use story_engage::media::LocalDirSink;
use story_engage::store::{EngagementStore, MemoryStore, PgStore};
use story_engage::{DirectMessenger, DomProbe, EngineDeps, RunContext, StoryEngine, TraversalConfig};

#[derive(Parser)]
#[command(name = "story-engage", about = "Story carousel engagement runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Walk the story carousel once.
    Run {
        /// Stop after this many new stories.
        #[arg(long, default_value_t = 20)]
        story_limit: usize,

        /// Only reply to targets with auto-reply enabled.
        #[arg(long)]
        auto_reply_only: bool,
    },
    /// Send one direct message.
    Message {
        #[arg(long)]
        to: String,

        #[arg(long)]
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("story_engage=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    config.log_redacted();

    let credentials =
        SessionCredentials::from_cookie_header(&config.session_cookies, &config.app_id, &config.user_agent);
    if credentials.csrf_token().is_none() {
        warn!("No csrftoken in SESSION_COOKIES; API writes will fall back to the UI");
    }
    let api = Arc::new(ApiClient::new(&config.api_base_url, credentials)?);

    let session: Arc<dyn BrowserSession> = Arc::new(
        CdpSession::connect(&config.browser_ws_url)
            .await
            .context("connecting to browser")?,
    );
    let probe = Arc::new(DomProbe::new(session, &config.web_base_url));

    let store: Arc<dyn EngagementStore> = match &config.database_url {
        Some(url) => {
            let pg = PgStore::connect(url).await?;
            pg.migrate().await?;
            Arc::new(pg)
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory store; nothing persists past this run");
            Arc::new(MemoryStore::new())
        }
    };

    let verify = VerifyConfig {
        realtime_host: config.realtime_host.clone(),
        ..VerifyConfig::default()
    };

    match cli.command {
        Command::Run {
            story_limit,
            auto_reply_only,
        } => {
            let traversal = TraversalConfig {
                pacing: Duration::from_millis(config.story_pacing_ms),
                verify,
                ..TraversalConfig::default()
            };
            let engine = StoryEngine::new(
                &config.account,
                EngineDeps {
                    probe,
                    api,
                    generator: Arc::new(HttpAnalysisClient::new(&config.analysis_url)?),
                    sink: Arc::new(LocalDirSink::new(config.media_dir.clone())),
                    store,
                },
                traversal,
            );
            let stats = engine.run(story_limit, auto_reply_only).await?;
            info!(exit_reason = ?stats.exit_reason, "Run finished");
        }
        Command::Message { to, text } => {
            let messenger = DirectMessenger::new(api, probe, store, verify);
            let mut ctx = RunContext::new();
            let result = messenger.send(&mut ctx, &to, &text).await?;
            info!(
                to = %to,
                posted = result.posted,
                method = ?result.method,
                reason = ?result.reason,
                "Direct message finished"
            );
        }
    }

    Ok(())
}
