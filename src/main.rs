use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use enhaia::credentials::{ApiKeySlot, CredentialHost};
use enhaia::dispatcher::Dispatcher;
use enhaia::gemini::GeminiClient;
use enhaia::orchestrator::Orchestrator;
use enhaia::store::ChatStore;
use enhaia::{chat, constants, web_server};

// Define the command-line interface structure using clap
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Directory holding the stored chats.
    #[arg(long, global = true, env = "ENHAIA_DATA_DIR", default_value_t = constants::DATA_DIR.clone())]
    data_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the enhaIA web server.
    Start {
        #[arg(long, default_value_t = 9900, help = "Port for the web server.")]
        port: u16,
    },
    /// Chat with enhaIA in the terminal.
    Chat,
    /// List stored chats.
    List,
}

async fn build_orchestrator(
    data_dir: &str,
    api_key: &ApiKeySlot,
    shutdown: &CancellationToken,
) -> Orchestrator {
    let client = GeminiClient::new(api_key.clone()).with_cancellation(shutdown.clone());
    let host: Arc<dyn CredentialHost> = Arc::new(api_key.clone());
    let dispatcher = Dispatcher::new(Arc::new(client), Some(host));
    Orchestrator::start(ChatStore::in_dir(data_dir), dispatcher).await
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for GEMINI_API_KEY and friends)
    dotenvy::dotenv().ok();

    // Reads log level from RUST_LOG (e.g. RUST_LOG=info,enhaia=debug)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    info!("enhaIA starting with command: {:?}", cli.command);

    let api_key = ApiKeySlot::from_env();
    let shutdown = CancellationToken::new();

    match cli.command {
        Commands::Start { port } => {
            info!("Starting enhaIA on port {}...", port);
            let orchestrator = build_orchestrator(&cli.data_dir, &api_key, &shutdown).await;

            let server_shutdown = shutdown.clone();
            let mut web_server_handle = tokio::spawn(async move {
                if let Err(e) = web_server::start_web_server(
                    port,
                    orchestrator,
                    api_key,
                    web_server::WebConfig::default(),
                    server_shutdown,
                )
                .await
                {
                    error!("Web server failed: {:?}", e);
                }
            });

            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);

            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Ctrl-C received, initiating shutdown...");
                    // Also stops any video generation still polling.
                    shutdown.cancel();
                }
                res = &mut web_server_handle => {
                    match res {
                        Ok(_) => info!("Web server task completed unexpectedly."),
                        Err(e) if e.is_panic() => error!("Web server task panicked: {:?}", e),
                        Err(e) => error!("Web server task failed: {:?}", e),
                    }
                }
            }

            if !web_server_handle.is_finished() {
                info!("Waiting for web server to drain...");
                if let Err(e) = web_server_handle.await {
                    error!("Web server task failed during shutdown: {:?}", e);
                }
            }
            info!("Shutdown complete.");
        }
        Commands::Chat => {
            let orchestrator = build_orchestrator(&cli.data_dir, &api_key, &shutdown).await;
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            chat::run_chat_session(&orchestrator, stdin, tokio::io::stdout())
                .await
                .context("Chat session failed")?;
            shutdown.cancel();
        }
        Commands::List => {
            let state = ChatStore::in_dir(&cli.data_dir).load().await;
            for chat in &state.chats {
                let marker = if state.active_chat_id.as_deref() == Some(chat.id.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!("{} {}  {}  ({} messages)", marker, chat.id, chat.title, chat.messages.len());
            }
        }
    }

    Ok(())
}
