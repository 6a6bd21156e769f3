//! certsync - cloud store and local sync client for inspection certificates

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use certsync::config::{self, Config};
use certsync::models::ReportType;
use certsync::orchestrator::{ReportStatus, SyncOrchestrator};
use certsync::payload::Payload;
use certsync::resolver::ResolutionChoice;
use certsync::store::DraftStore;
use certsync::{CloudClient, HttpCloudClient, api, db};

#[derive(Parser)]
#[command(name = "certsync")]
#[command(about = "Local-first sync for electrical inspection certificates")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the cloud report server
    Serve {
        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Generate a new API token
    Token {
        /// Name/label for the token
        #[arg(short, long)]
        name: Option<String>,

        /// List all configured tokens
        #[arg(long)]
        list: bool,

        /// Revoke a token by name
        #[arg(long)]
        revoke: Option<String>,

        /// Config file path (for list/revoke operations)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Initialize a new config file
    Init {
        /// Output path for config file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Start a new report
    New {
        /// eicr, eic or minor-works
        #[arg(short = 't', long = "type")]
        report_type: ReportType,

        #[command(flatten)]
        payload: PayloadArgs,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// Apply section edits to a report
    Edit {
        id: String,

        #[command(flatten)]
        payload: PayloadArgs,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// Delete a report locally and in the cloud
    Delete {
        id: String,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// Print the local copy of a report
    Show {
        id: String,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// Fetch the cloud copy of a report unless local work is pending
    Pull {
        id: String,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// Show the sync state of every local report
    Status {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Push all queued work to the server
    Sync {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Resolve a version conflict
    Resolve {
        id: String,

        /// Keep one side as a whole
        #[arg(long, value_enum, conflicts_with = "file", required_unless_present = "file")]
        keep: Option<Side>,

        /// Hand-merged payload from a JSON file
        #[arg(long)]
        file: Option<PathBuf>,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// Re-queue operations that exhausted their retries
    Retry {
        id: String,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// Drop local changes and pending work for a report
    Discard {
        id: String,

        #[command(flatten)]
        client: ClientArgs,
    },
}

#[derive(clap::Args)]
struct ClientArgs {
    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only touch the local draft store
    #[arg(long)]
    offline: bool,
}

#[derive(clap::Args)]
struct PayloadArgs {
    /// Section value as name=json, e.g. --set 'installation={"earthing":"TN-S"}'
    #[arg(long = "set", value_name = "SECTION=JSON")]
    sets: Vec<String>,

    /// Section delta from a JSON object file
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Side {
    Mine,
    Theirs,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("certsync=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port, bind } => {
            let mut cfg = if let Some(path) = config {
                Config::load_from(&path)?
            } else {
                Config::load()?
            };

            // Override with CLI args
            if let Some(p) = port {
                cfg.server.port = p;
            }
            if let Some(b) = bind {
                cfg.server.bind = b;
            }

            run_server(cfg).await
        }

        Commands::Token {
            name,
            list,
            revoke,
            config,
        } => manage_tokens(name, list, revoke, config),

        Commands::Init { output } => {
            let path = output.unwrap_or_else(|| PathBuf::from("config.toml"));
            let cfg = Config::default();
            cfg.save_to(&path)?;

            println!("Created config file: {}", path.display());
            println!();
            println!("Next steps:");
            println!("  1. Generate a token: certsync token --name my-tablet");
            println!("  2. Put the token under [client] on each inspector device");
            println!(
                "  3. Start the server: certsync serve --config {}",
                path.display()
            );

            Ok(())
        }

        Commands::New {
            report_type,
            payload,
            client,
        } => {
            let engine = open_engine(&client).await?;
            let doc = engine.create_report(report_type, payload.read()?.unwrap_or_default())?;
            println!("Created {} report {}", doc.report_type, doc.id);
            finish(&engine, &client).await
        }

        Commands::Edit {
            id,
            payload,
            client,
        } => {
            let Some(delta) = payload.read()? else {
                bail!("Nothing to apply: pass --set or --file");
            };
            let engine = open_engine(&client).await?;
            let doc = engine.edit_report(&id, &delta).await?;
            println!("Report {} at local revision {}", doc.id, doc.local_revision);
            finish(&engine, &client).await
        }

        Commands::Delete { id, client } => {
            let engine = open_engine(&client).await?;
            engine.delete_report(&id).await?;
            println!("Deleted report {id}");
            finish(&engine, &client).await
        }

        Commands::Show { id, client } => {
            let engine = open_engine(&client).await?;
            let Some(doc) = engine.document(&id)? else {
                bail!("Report {id} is not in the local draft store (try: certsync pull {id})");
            };
            println!("{}", serde_json::to_string_pretty(&doc)?);
            print_status(&id, &engine.status(&id)?);
            engine.shutdown().await?;
            Ok(())
        }

        Commands::Pull { id, client } => {
            let engine = open_engine(&client).await?;
            let doc = engine.load_report(&id).await?;
            println!(
                "Report {} at cloud version {}",
                doc.id,
                doc.server_version
                    .map_or_else(|| "none".to_string(), |v| v.to_string())
            );
            print_status(&id, &engine.status(&id)?);
            engine.shutdown().await?;
            Ok(())
        }

        Commands::Status { client } => {
            let engine = open_engine(&client).await?;
            let reports = engine.store().list()?;
            if reports.is_empty() {
                println!("No local reports.");
            }
            for doc in reports {
                print_status(&doc.id, &engine.status(&doc.id)?);
            }
            engine.shutdown().await?;
            Ok(())
        }

        Commands::Sync { client } => {
            let engine = open_engine(&client).await?;
            finish(&engine, &client).await
        }

        Commands::Resolve {
            id,
            keep,
            file,
            client,
        } => {
            let choice = match (keep, file) {
                (Some(Side::Mine), _) => ResolutionChoice::KeepMine,
                (Some(Side::Theirs), _) => ResolutionChoice::KeepTheirs,
                (None, Some(path)) => ResolutionChoice::Manual(read_payload_file(&path)?),
                (None, None) => bail!("Pick --keep mine, --keep theirs or --file"),
            };

            let engine = open_engine(&client).await?;
            engine.resolve_conflict(&id, choice).await?;
            println!("Resolved conflict on {id}");
            finish(&engine, &client).await
        }

        Commands::Retry { id, client } => {
            let engine = open_engine(&client).await?;
            let count = engine.retry_abandoned(&id).await?;
            println!("Re-queued {count} operation(s) for {id}");
            finish(&engine, &client).await
        }

        Commands::Discard { id, client } => {
            let engine = open_engine(&client).await?;
            engine.discard_local(&id).await?;
            println!("Discarded local changes for {id}");
            finish(&engine, &client).await
        }
    }
}

impl PayloadArgs {
    /// File contents first, then each `--set` on top
    fn read(&self) -> Result<Option<Payload>> {
        if self.sets.is_empty() && self.file.is_none() {
            return Ok(None);
        }

        let mut payload = match &self.file {
            Some(path) => read_payload_file(path)?,
            None => Payload::new(),
        };
        for set in &self.sets {
            let Some((section, raw)) = set.split_once('=') else {
                bail!("Expected SECTION=JSON, got '{set}'");
            };
            // Bare words are taken as strings
            let value = serde_json::from_str(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
            payload.insert(section.trim(), value);
        }
        Ok(Some(payload))
    }
}

fn read_payload_file(path: &Path) -> Result<Payload> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Payload::from_json(&text)?)
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

/// Open the local draft store and bring its queue back in line
async fn open_engine(args: &ClientArgs) -> Result<Arc<SyncOrchestrator>> {
    let cfg = load_config(args.config.as_deref())?;

    if let Some(parent) = cfg.client.data_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create data directory")?;
    }
    let store = Arc::new(
        DraftStore::open(&cfg.client.data_path).context("Failed to open draft store")?,
    );
    let cloud: Arc<dyn CloudClient> = Arc::new(HttpCloudClient::new(
        cfg.client.server_url.clone(),
        cfg.client.token.clone(),
        cfg.sync.request_timeout(),
    )?);

    let engine = SyncOrchestrator::new(store, cloud, cfg.sync.clone())?;
    if args.offline {
        engine.set_online(false)?;
    }
    engine.recover().await?;
    Ok(engine)
}

/// Queue debounced edits, push them unless offline, then report what is left
async fn finish(engine: &Arc<SyncOrchestrator>, args: &ClientArgs) -> Result<()> {
    engine.flush_edits().await?;
    if !args.offline {
        let drained = engine.sync_now().await?;
        tracing::debug!(drained, "Sync pass finished");
    }

    let mut outstanding = 0;
    for doc in engine.store().list()? {
        let status = engine.status(&doc.id)?;
        if status != ReportStatus::Clean {
            outstanding += 1;
            print_status(&doc.id, &status);
        }
    }
    if outstanding == 0 {
        println!("All reports in sync.");
    }

    engine.shutdown().await?;
    Ok(())
}

fn print_status(report_id: &str, status: &ReportStatus) {
    match status {
        ReportStatus::Retrying {
            attempts,
            next_retry_at,
        } => println!(
            "  {report_id}  retrying (attempt {attempts}, next at {})",
            next_retry_at.format("%H:%M:%S")
        ),
        ReportStatus::Conflicted(conflict) => println!(
            "  {report_id}  conflicted with cloud version {} (certsync resolve {report_id} --keep mine|theirs)",
            conflict.remote_current_version
        ),
        ReportStatus::Failed(failure) => println!("  {report_id}  failed: {failure}"),
        other => println!("  {report_id}  {}", other.label()),
    }
}

fn manage_tokens(
    name: Option<String>,
    list: bool,
    revoke: Option<String>,
    config: Option<PathBuf>,
) -> Result<()> {
    let config_path = if let Some(path) = config {
        path
    } else {
        Config::default_path()?
    };

    // List tokens
    if list {
        if !config_path.exists() {
            println!("No config file found at {}", config_path.display());
            println!("Run 'certsync init' to create one.");
            return Ok(());
        }

        let cfg = Config::load_from(&config_path)?;
        if cfg.tokens.is_empty() {
            println!("No tokens configured.");
            println!("Generate one with: certsync token --name <device-name>");
        } else {
            println!("Configured tokens:");
            println!();
            for token in &cfg.tokens {
                // Show truncated hash (first 20 chars)
                let hash_preview = if token.token_hash.len() > 20 {
                    format!("{}...", &token.token_hash[..20])
                } else {
                    token.token_hash.clone()
                };
                println!("  {} - {}", token.name, hash_preview);
            }
        }
        return Ok(());
    }

    // Revoke token
    if let Some(token_name) = revoke {
        if !config_path.exists() {
            println!("No config file found at {}", config_path.display());
            return Ok(());
        }

        let mut cfg = Config::load_from(&config_path)?;
        let original_len = cfg.tokens.len();
        cfg.tokens.retain(|t| t.name != token_name);

        if cfg.tokens.len() == original_len {
            println!("Token '{}' not found.", token_name);
        } else {
            cfg.save_to(&config_path)?;
            println!("Revoked token '{}'.", token_name);
        }
        return Ok(());
    }

    let token = generate_token();
    let label = name.unwrap_or_else(|| "default".to_string());
    let token_hash = config::hash_token(&token)?;

    if config_path.exists() {
        let mut cfg = Config::load_from(&config_path)?;
        if cfg.tokens.iter().any(|t| t.name == label) {
            println!(
                "Token '{}' already exists. Use --revoke first to replace it.",
                label
            );
            return Ok(());
        }

        cfg.tokens.push(config::TokenConfig {
            name: label.clone(),
            token_hash,
        });
        cfg.save_to(&config_path)?;
        println!("Generated API token for '{}'\n", label);
    } else {
        println!("Generated API token for '{}':\n", label);
        println!("Add this to your server's config.toml:\n");
        println!("  [[tokens]]");
        println!("  name = \"{}\"", label);
        println!("  token_hash = \"{}\"\n", token_hash);
    }

    println!("Token: {}\n", token);
    println!("On the inspector's device, add to config.toml:");
    println!("  [client]");
    println!("  server_url = \"http://YOUR_SERVER_IP:3030\"");
    println!("  token = \"{}\"\n", token);
    println!("Save this token now - it cannot be retrieved later!");

    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    let db = db::Database::open(&config.database.path).context("Failed to open database")?;

    let state = api::AppState::new(db, config.clone());
    let app = api::create_router(state);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("certsync server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutting down");
}

fn generate_token() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();

    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

    let token_body: String = bytes
        .iter()
        .map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char)
        .collect();

    format!("crt_{}", token_body)
}
