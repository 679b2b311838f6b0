use anyhow::Context;
use ark_server::{ArkServer, RootConfig, ServerConfig};
use ark_upload::{JournalPersistence, Persistence};
use colored::Colorize;
use tracing::debug;

use crate::cli::{Cli, Command, JournalArgs, ServeArgs};

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Serve(args) => cmd_serve(args).await,
        Command::Config(args) => cmd_config(args),
        Command::Sessions(args) => cmd_sessions(args).await,
        Command::Compact(args) => cmd_compact(args).await,
    }
}

/// Load the config file, if any, and apply command-line overrides.
fn effective_config(args: ServeArgs) -> anyhow::Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(root) = args.root {
        config.root = root;
    }
    if let Some(id) = args.storage_root_id {
        config.storage_root_id = id;
    }
    if let Some(journal) = args.journal {
        config.journal_path = Some(journal);
    }
    config
        .roots
        .extend(args.extra_roots.into_iter().map(|(id, path)| RootConfig { id, path }));
    if args.no_uploads {
        config.uploads_dir = None;
    }
    if args.require_auth {
        config.allow_anonymous = false;
    }
    config.validate()?;
    Ok(config)
}

async fn cmd_serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = effective_config(args)?;
    debug!(?config, "effective configuration");
    println!(
        "{} ark serving {} on {}",
        "✓".green().bold(),
        config.root.display().to_string().bold(),
        config.bind_addr.to_string().cyan()
    );
    for root in &config.roots {
        println!("  also serving {} from {}", root.id.yellow(), root.path.display());
    }
    ArkServer::new(config).serve().await?;
    Ok(())
}

fn cmd_config(args: ServeArgs) -> anyhow::Result<()> {
    print!("{}", effective_config(args)?.to_toml_string()?);
    Ok(())
}

async fn cmd_sessions(args: JournalArgs) -> anyhow::Result<()> {
    let journal = open_journal(&args)?;
    let ids = journal.session_ids().await?;
    if ids.is_empty() {
        println!("No upload sessions.");
        return Ok(());
    }
    for id in ids {
        let record = journal.get_session(&id).await?;
        println!(
            "{}  {}  {} upload(s)  {}",
            record.id.yellow(),
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.uploads.len(),
            record.config.user_id.bold()
        );
    }
    Ok(())
}

async fn cmd_compact(args: JournalArgs) -> anyhow::Result<()> {
    let journal = open_journal(&args)?;
    let before = journal.offset();
    let after = journal.compact().await?;
    println!(
        "{} Compacted {}: {} -> {} bytes",
        "✓".green(),
        args.path.display(),
        before,
        after
    );
    Ok(())
}

fn open_journal(args: &JournalArgs) -> anyhow::Result<JournalPersistence> {
    if !args.path.exists() {
        anyhow::bail!("no journal at {}", args.path.display());
    }
    JournalPersistence::open(&args.path)
        .with_context(|| format!("opening journal {}", args.path.display()))
}
