use clap::{Parser, Subcommand};
use std::io::Write;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

use deep_research::{
    config::Config,
    create_router,
    db::{create_pool, ConversationStore, InMemoryConversationStore, PgConversationStore},
    llm::LLMService,
    research::{ResearchEvent, ResearchOrchestrator},
    tools::{SerpApiTools, ToolExecutor},
    utils::init_logger,
    AppState,
};

#[derive(Parser)]
#[command(name = "deep-research", version, about = "Multi-agent research with streamed, cited reports")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Research one question and print the report
    Ask {
        /// The research question
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::from_env()?;
    let _log_guard = init_logger(&config.logging);
    info!("Configuration loaded: {:?}", config.server);

    let state = build_state(&config).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(state, &config).await,
        Command::Ask { query } => ask(state, query.join(" ")).await,
    }
}

async fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let pool = create_pool(&config.database).await?;

    let store: Arc<dyn ConversationStore> = match &pool {
        Some(pool) => {
            info!("Running database migrations...");
            sqlx::migrate!("./migrations")
                .run(pool)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;
            info!("Database migrations completed");
            Arc::new(PgConversationStore::new(pool.clone()))
        }
        None => {
            warn!("DATABASE_URL not set; transcripts are kept in memory only");
            Arc::new(InMemoryConversationStore::new())
        }
    };

    let llm = Arc::new(LLMService::from_config(&config.llm, &config.research)?);
    let tools: Arc<dyn ToolExecutor> = Arc::new(SerpApiTools::from_config(&config.search)?);
    let orchestrator = Arc::new(ResearchOrchestrator::new(
        llm.clone(),
        tools,
        store,
        config.research.clone(),
    ));

    Ok(AppState {
        orchestrator,
        llm,
        pool,
        config: config.clone(),
    })
}

async fn serve(state: AppState, config: &Config) -> anyhow::Result<()> {
    let app = create_router(state);

    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}

async fn ask(state: AppState, query: String) -> anyhow::Result<()> {
    let mut events = state.orchestrator.clone().spawn(Uuid::new_v4(), query);
    let mut stdout = std::io::stdout();

    while let Some(event) = events.recv().await {
        match event {
            ResearchEvent::Phase { phase, message } => eprintln!("[{}] {}", phase, message),
            ResearchEvent::Progress {
                completed,
                total,
                sub_question,
                message,
                ..
            } => eprintln!(
                "  ({}/{}) {}{}",
                completed,
                total,
                sub_question,
                message.map(|m| format!(" - {}", m)).unwrap_or_default()
            ),
            ResearchEvent::Content { content } => {
                write!(stdout, "{}", content)?;
                stdout.flush()?;
            }
            ResearchEvent::Done { references, stats } => {
                writeln!(stdout)?;
                if !references.is_empty() {
                    writeln!(stdout, "\n## References\n")?;
                    for reference in &references {
                        writeln!(stdout, "[{}] {} - {}", reference.reference_number, reference.title, reference.url)?;
                    }
                }
                eprintln!(
                    "{} sources, {} tool calls, {:.1}s",
                    stats.total_sources, stats.total_tool_calls, stats.duration_seconds
                );
            }
            ResearchEvent::Error { message } => anyhow::bail!(message),
            _ => {}
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
