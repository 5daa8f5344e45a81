use anyhow::{Context, Result};
use ballot_core::{
    AnswerRequest, Determinism, Partition, PipelineError, PipelineEvent, SizeClass,
};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod wiring;

use config::BallotConfig;

#[derive(Parser)]
#[command(name = "ballot")]
#[command(version)]
#[command(about = "Ballot: sourced answers about party positions")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the WebSocket gateway
    Serve,

    /// Answer one question, streaming to stdout
    Ask {
        /// The question to answer
        question: String,

        /// Partition to search, as collection:namespace (repeatable)
        #[arg(short, long = "partition", required = true)]
        partitions: Vec<String>,

        /// Use the large model tier
        #[arg(long)]
        large: bool,

        /// Allow premium models
        #[arg(long)]
        premium: bool,
    },

    /// Print the fallback chain for every tier
    Providers,

    /// Show current configuration
    Config,

    /// Initialize config directory and default config
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Providers => cmd_providers(&cli.config).await,
        Commands::Serve => cmd_serve(&cli.config).await,
        Commands::Ask {
            question,
            partitions,
            large,
            premium,
        } => cmd_ask(&cli.config, &question, &partitions, large, premium).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    println!("Ballot initialized at {}", config_dir.display());
    println!(
        "Edit {} to configure API keys, models and index hosts.",
        config_path.display()
    );
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = BallotConfig::load(config_path)?;
    println!("{:#?}", cfg);
    Ok(())
}

async fn cmd_providers(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = BallotConfig::load(config_path)?;
    let router = wiring::build_router(&cfg)?;
    let registry = router.registry();

    for size in [SizeClass::Small, SizeClass::Large] {
        for determinism in [Determinism::Deterministic, Determinism::NonDeterministic] {
            for premium in [false, true] {
                let chain = match registry.list_candidates(size, premium, determinism) {
                    Ok(models) => models
                        .iter()
                        .map(|m| m.label())
                        .collect::<Vec<_>>()
                        .join(" -> "),
                    Err(_) => "(none)".to_string(),
                };
                let tier = if premium { "premium" } else { "standard" };
                println!(
                    "{:<6} {:<18} {:<9} {}",
                    size.to_string(),
                    determinism.to_string(),
                    tier,
                    chain
                );
            }
        }
    }
    Ok(())
}

async fn cmd_serve(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = BallotConfig::load(config_path)?;
    let pipeline = wiring::build_pipeline(&cfg)?;

    let addr: SocketAddr = format!("{}:{}", cfg.gateway.bind, cfg.gateway.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid gateway address {}:{}",
                cfg.gateway.bind, cfg.gateway.port
            )
        })?;
    let server = ballot_gateway::GatewayServer::new(addr, pipeline);

    tokio::select! {
        result = server.run() => result,
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    }
}

async fn cmd_ask(
    config_path: &Option<PathBuf>,
    question: &str,
    partitions: &[String],
    large: bool,
    premium: bool,
) -> Result<()> {
    let cfg = BallotConfig::load(config_path)?;

    let partitions = partitions
        .iter()
        .map(|raw| {
            Partition::parse(raw).with_context(|| {
                format!("Invalid partition '{}', expected collection:namespace", raw)
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let size = if large { SizeClass::Large } else { SizeClass::Small };
    let request = AnswerRequest::new(question, partitions)
        .with_size(size)
        .with_premium(premium);

    let pipeline = wiring::build_pipeline(&cfg)?;
    let (tx, mut rx) = mpsc::channel::<PipelineEvent>(64);
    let cancel = CancellationToken::new();

    let answer = {
        let cancel = cancel.clone();
        tokio::spawn(async move { pipeline.answer(&request, &tx, cancel).await })
    };

    let printer = async move {
        let mut sources = Vec::new();
        let mut stdout = std::io::stdout();
        while let Some(event) = rx.recv().await {
            match event {
                PipelineEvent::SourcesReady { documents, .. } => sources = documents,
                PipelineEvent::Chunk(chunk) if chunk.is_final => {
                    println!();
                    if let Some(error) = &chunk.error {
                        eprintln!("Answer incomplete: {}", error);
                    }
                    break;
                }
                PipelineEvent::Chunk(chunk) => {
                    print!("{}", chunk.text);
                    let _ = stdout.flush();
                }
            }
        }
        sources
    };

    let sources = tokio::select! {
        sources = printer => sources,
        _ = signal::ctrl_c() => {
            cancel.cancel();
            Vec::new()
        }
    };

    match answer.await.context("Answer task panicked")? {
        Ok(summary) => {
            if !sources.is_empty() {
                println!("\nSources:");
                for (i, doc) in sources.iter().enumerate() {
                    let label = doc.title.as_deref().unwrap_or(&doc.id);
                    match &doc.url {
                        Some(url) => println!("  [{}] {} ({}) {}", i + 1, label, doc.namespace, url),
                        None => println!("  [{}] {} ({})", i + 1, label, doc.namespace),
                    }
                }
            }
            info!(
                "Answered by {} after {} failed attempts",
                summary.model, summary.failed_attempts
            );
            Ok(())
        }
        Err(PipelineError::Cancelled) => {
            warn!("Cancelled");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
