mod chat;
mod chunker;
mod config;
mod error;
mod models;
mod notify;
mod pool;
mod prompt;
mod server;
mod tokens;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Request;
use clap::Parser;
use dotenvy::dotenv;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use std::error::Error;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::chat::ChatOrchestrator;
use crate::chat::retrieval::WeaviateRetriever;
use crate::chat::upstream::HttpCompletionClient;
use crate::models::ModelRegistry;
use crate::notify::NotifyDispatcher;
use crate::pool::ConnectionPool;
use crate::prompt::PromptResolver;
use crate::prompt::providers::{PageCrawler, TikaFileProvider};

#[derive(Parser)]
#[command(name = "ragway", about = "Streaming RAG inference gateway")]
enum Cli {
    /// Start the HTTP/WebSocket server (default when no subcommand is given)
    #[command(alias = "run")]
    Serve,
    /// Split stdin into token-bounded chunks, one JSON object per line
    Split {
        /// Token budget per chunk
        #[arg(long, default_value_t = 2000)]
        budget: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    // Default to Serve when no subcommand is given, but still allow --help
    // and --version to work.
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 {
        Cli::Serve
    } else {
        Cli::parse()
    };

    match cli {
        Cli::Serve => run_server().await,
        Cli::Split { budget } => {
            split_stdin(budget)?;
            Ok(())
        }
    }
}

fn split_stdin(budget: usize) -> Result<()> {
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .context("failed to read stdin")?;
    for chunk in chunker::split(&text, budget.max(1)) {
        println!("{}", serde_json::to_string(&chunk)?);
    }
    Ok(())
}

async fn run_server() -> Result<(), Box<dyn Error>> {
    let config = config::Config::from_env();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ragway=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: !config.is_production(),
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    // Per-request timeouts are set where each call is made; streaming
    // completions can run for minutes.
    let http_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;

    let upstream = Arc::new(HttpCompletionClient::new(http_client.clone(), &config.upstream));
    let models = Arc::new(ModelRegistry::builtin(config.upstream.default_model.clone()));
    models
        .get(models.default_model())
        .context("DEFAULT_CHAT_MODEL is not a known model")?;

    let resolver = Arc::new(PromptResolver::new(
        models,
        Arc::new(PageCrawler::new(http_client.clone(), &config.providers)),
        Arc::new(TikaFileProvider::new(http_client.clone(), &config.providers)),
        config.providers.failure_policy,
    ));
    let retriever = Arc::new(WeaviateRetriever::new(
        http_client.clone(),
        upstream.clone(),
        &config.retrieval,
    ));
    let orchestrator =
        Arc::new(ChatOrchestrator::new(resolver, upstream.clone()).with_retriever(retriever));

    let pool = Arc::new(
        ConnectionPool::new(config.ws.send_timeout)
            .with_observer(Arc::new(server::ws::ConnectionLogger))
            .with_broadcast(Arc::new(server::ws::GroupRouter)),
    );
    let notifier = Arc::new(NotifyDispatcher::new(http_client, &config.notify));

    let port = config.port;
    let app_state = server::AppState {
        config: Arc::new(config),
        pool,
        orchestrator,
        completions: upstream.clone(),
        embedder: upstream,
        notifier,
    };

    let app = server::create_app(app_state)
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
