//! spillctl - maintenance tool for a spillbox archive

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use spillbox::{MailboxId, Spillbox, SpillboxConfig};

#[derive(Parser)]
#[command(name = "spillctl", version, about = "Inspect and maintain a spillbox archive")]
struct Cli {
    /// Archive directory [default: from spillbox.json, SPILLBOX_DATA_DIR, or
    /// the platform data directory]
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Read settings from this JSON file instead of ~/.config/spillbox
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the current settings as a JSON config file.
    ///
    /// Goes to --config if given, else ~/.config/spillbox/spillbox.json.
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// List live mailboxes with their UIDVALIDITY and counters.
    Mailboxes,
    /// Create a mailbox.
    CreateMailbox { name: String },
    /// Rename a mailbox. This invalidates client UID caches.
    RenameMailbox { id: i64, new_name: String },
    /// Delete a mailbox. Its messages and mod-sequence history are kept.
    DeleteMailbox { id: i64 },
    /// List live labels.
    Labels,
    /// Tombstone blobs referenced only by expunged messages.
    Sweep,
    /// Erase tombstoned blob content past the grace interval.
    ///
    /// Interrupting with Ctrl-C stops between batches; work done so far is
    /// kept and the next run continues from there.
    Gc {
        /// Grace interval in seconds [default: gc_grace_secs from config]
        #[arg(long)]
        grace_secs: Option<i64>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<SpillboxConfig> {
    let mut cfg = match &cli.config {
        Some(path) => SpillboxConfig::from_file(path)?,
        None => SpillboxConfig::load()?,
    };
    if let Some(dir) = &cli.data_dir {
        cfg.data_dir = Some(dir.clone());
    }
    Ok(cfg)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_config(cli: &Cli, force: bool) -> Result<()> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => SpillboxConfig::default_config_path()
            .context("Could not determine config directory")?,
    };
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    // An explicit --config is the target, so start from defaults
    let mut cfg = match &cli.config {
        Some(_) => SpillboxConfig::default(),
        None => SpillboxConfig::load()?,
    };
    if let Some(dir) = &cli.data_dir {
        cfg.data_dir = Some(dir.clone());
    }

    match &cli.config {
        Some(path) => cfg.save_to(path)?,
        None => {
            cfg.save()?;
        }
    }
    info!("Wrote config to {}", path.display());
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    if let Command::InitConfig { force } = cli.command {
        return init_config(&cli, force);
    }

    let cfg = load_config(&cli)?;
    let dir = cfg.resolve_data_dir()?;
    let grace_default = cfg.gc_grace();
    let store = Spillbox::open(&dir, cfg)
        .with_context(|| format!("Failed to open archive at {:?}", dir))?;

    match cli.command {
        Command::InitConfig { .. } => unreachable!("handled before opening the archive"),
        Command::Mailboxes => print_json(&store.list_mailboxes()?)?,
        Command::CreateMailbox { name } => {
            let id = store.create_mailbox(&name)?;
            print_json(&store.get_mailbox(id)?)?;
        }
        Command::RenameMailbox { id, new_name } => {
            let id = MailboxId::new(id);
            store.rename_mailbox(id, &new_name)?;
            print_json(&store.get_mailbox(id)?)?;
        }
        Command::DeleteMailbox { id } => store.delete_mailbox(MailboxId::new(id))?,
        Command::Labels => print_json(&store.list_labels()?)?,
        Command::Sweep => print_json(&store.sweep_expunged()?)?,
        Command::Gc { grace_secs } => {
            let grace = grace_secs
                .map(chrono::Duration::seconds)
                .unwrap_or(grace_default);

            let cancel = Arc::new(AtomicBool::new(false));
            for signal in [SIGINT, SIGTERM] {
                signal_hook::flag::register(signal, Arc::clone(&cancel))
                    .context("Failed to install signal handler")?;
            }

            info!("Collecting blobs tombstoned more than {}s ago", grace.num_seconds());
            let stats = store.garbage_collect(chrono::Utc::now(), grace, Some(cancel.as_ref()))?;
            print_json(&stats)?;
        }
    }

    Ok(())
}
