use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kaonasi::agent::providers;
use kaonasi::channel::telegram::{self, TelegramClient};
use kaonasi::config::{self, KaonasiConfig, StorageBackend, StorageConfig};
use kaonasi::dispatch::{DispatchSettings, Dispatcher};
use kaonasi::store::{InMemoryStore, PersonaStore, SqliteStore};
use kaonasi::{gateway, secrets};

#[derive(Parser)]
#[command(name = "kaonasi")]
#[command(about = "A multi-persona Telegram chat bot")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot with Telegram long-polling
    Run,

    /// Run the bot behind a webhook
    Serve {
        /// Port to bind to (overrides gateway.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address (overrides gateway.bind)
        #[arg(short, long)]
        bind: Option<String>,

        /// Public base URL to register with Telegram
        #[arg(long, env = "KAONASI_PUBLIC_URL")]
        public_url: Option<String>,
    },

    /// Manage personas
    Persona {
        #[command(subcommand)]
        action: PersonaAction,
    },

    /// Store the remote model API key
    Login,

    /// Show configuration status
    Status,
}

#[derive(Subcommand)]
enum PersonaAction {
    /// List personas
    List,
    /// Create a persona
    Add {
        name: String,
        prompt: String,
        /// Comma-separated keywords
        #[arg(short, long, value_delimiter = ',')]
        keywords: Vec<String>,
    },
    /// Clear a persona's memory
    Clear { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            let config = config::load()?;
            run_polling(&config).await
        }
        Commands::Serve {
            port,
            bind,
            public_url,
        } => {
            let mut config = config::load()?;
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if let Some(bind) = bind {
                config.gateway.bind = bind;
            }
            if public_url.is_some() {
                config.gateway.public_url = public_url;
            }
            config::validate(&config)?;
            serve(&config).await
        }
        Commands::Persona { action } => {
            let config = config::load()?;
            manage_personas(&config, action).await
        }
        Commands::Login => login(),
        Commands::Status => status().await,
    }
}

fn open_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn PersonaStore>> {
    match config.backend {
        StorageBackend::Sqlite => Ok(Arc::new(SqliteStore::open(&config.path)?)),
        StorageBackend::Memory => {
            warn!("using in-memory storage, personas are lost on exit");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

fn telegram_client(config: &KaonasiConfig) -> anyhow::Result<Arc<TelegramClient>> {
    let token = config.telegram.token.as_deref().ok_or_else(|| {
        anyhow::anyhow!("Telegram token missing. Set TELEGRAM_BOT_TOKEN or telegram.token.")
    })?;
    Ok(Arc::new(TelegramClient::new(token)))
}

async fn build_dispatcher(
    config: &KaonasiConfig,
    client: Arc<TelegramClient>,
) -> anyhow::Result<Arc<Dispatcher>> {
    let store = open_store(&config.storage)?;
    let model = providers::from_config(&config.remote)?;
    if model.is_none() {
        info!("remote model not configured, using keyword routing and local replies");
    }

    let handle = match &config.telegram.handle {
        Some(handle) => handle.clone(),
        None => client.get_me().await?,
    };
    info!(handle = %handle, "bot identity resolved");

    let settings = DispatchSettings::from_config(&config.dispatch).with_bot_handle(handle);
    Ok(Arc::new(Dispatcher::new(
        store,
        model,
        client,
        config.routing.clone(),
        settings,
    )))
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            cancel.cancel();
        }
    });
}

async fn run_polling(config: &KaonasiConfig) -> anyhow::Result<()> {
    let client = telegram_client(config)?;
    client.delete_webhook().await?;
    let dispatcher = build_dispatcher(config, Arc::clone(&client)).await?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    telegram::run_polling(
        client,
        Arc::clone(&dispatcher),
        config.telegram.poll_timeout_secs,
        cancel,
    )
    .await?;
    dispatcher.shutdown().await;
    Ok(())
}

async fn serve(config: &KaonasiConfig) -> anyhow::Result<()> {
    let client = telegram_client(config)?;
    if let Some(public_url) = &config.gateway.public_url {
        let url = format!("{}/webhook/telegram", public_url.trim_end_matches('/'));
        client
            .set_webhook(&url, config.gateway.secret_token.as_deref())
            .await?;
    } else {
        warn!("no public URL configured, assuming the webhook is already registered");
    }
    let dispatcher = build_dispatcher(config, client).await?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    gateway::run(&config.gateway, Arc::clone(&dispatcher), cancel).await?;
    dispatcher.shutdown().await;
    Ok(())
}

async fn manage_personas(config: &KaonasiConfig, action: PersonaAction) -> anyhow::Result<()> {
    let store = open_store(&config.storage)?;
    match action {
        PersonaAction::List => {
            let personas = store.list_personas().await?;
            if personas.is_empty() {
                println!("No personas.");
            }
            for persona in personas {
                println!("{}  {}  [{}]", persona.id, persona.name, persona.keywords.join(", "));
            }
        }
        PersonaAction::Add {
            name,
            prompt,
            mut keywords,
        } => {
            if keywords.is_empty() {
                if let Some(model) = providers::from_config(&config.remote)? {
                    keywords = model
                        .extract_keywords(&prompt, config.dispatch.keyword_count)
                        .await;
                }
            }
            let persona = store.create_persona(&name, &prompt, keywords).await?;
            println!("Created persona {} ({})", persona.name, persona.id);
        }
        PersonaAction::Clear { name } => {
            store.clear_history(&name).await?;
            println!("Cleared memory of {name}");
        }
    }
    Ok(())
}

fn login() -> anyhow::Result<()> {
    let key = rpassword::prompt_password("Remote model API key: ")?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("no API key entered");
    }
    let path = secrets::store_api_key(key)?;
    println!("API key saved to {}", path.display());
    Ok(())
}

async fn status() -> anyhow::Result<()> {
    println!("kaonasi v{}", env!("CARGO_PKG_VERSION"));
    let config = config::load()?;

    println!(
        "telegram: {}",
        if config.telegram.token.is_some() { "token set" } else { "no token" }
    );
    println!(
        "remote model: {}",
        if config.remote.is_configured() { "configured" } else { "local fallback only" }
    );
    match config.storage.backend {
        StorageBackend::Sqlite => println!("storage: sqlite at {}", config.storage.path.display()),
        StorageBackend::Memory => println!("storage: memory"),
    }
    println!("gateway: {}:{}", config.gateway.bind, config.gateway.port);

    if config.storage.backend == StorageBackend::Sqlite && config.storage.path.exists() {
        let store = open_store(&config.storage)?;
        println!("personas: {}", store.list_personas().await?.len());
    }
    Ok(())
}
