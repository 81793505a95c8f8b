use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use credvault_core::paths::{data_dir, settings_path, store_path};
use credvault_core::{FileStore, ManagerState, MasterPasswordManager, RotationReport, VaultSettings};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

const PASSWORD_ENV: &str = "CREDVAULT_PASSWORD";
const NEW_PASSWORD_ENV: &str = "CREDVAULT_NEW_PASSWORD";

#[derive(Parser, Debug)]
#[command(name = "credvault", author, version, about = "Encrypted local credential store", long_about = None)]
struct Cli {
    /// Directory holding records.json and settings.json
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Set the master password and encrypt existing records
    Init,

    /// Store a value (read from stdin when omitted)
    Set { key: String, value: Option<String> },

    /// Print a value
    Get { key: String },

    /// Remove a record
    Rm { key: String },

    /// List record keys
    List,

    /// Encrypt remaining plaintext records
    Migrate,

    /// Re-encrypt every record under a freshly derived key
    Rotate,

    /// Change the master password
    ChangePassword,

    /// Show vault, lockout and rotation state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mgr = open_vault(cli.data_dir)?;
    match cli.command {
        Commands::Init => init_command(&mgr).await,
        Commands::Set { key, value } => set_command(&mgr, &key, value).await,
        Commands::Get { key } => get_command(&mgr, &key).await,
        Commands::Rm { key } => {
            mgr.remove(&key).await?;
            println!("removed {key}");
            Ok(())
        }
        Commands::List => {
            for key in mgr.keys().await? {
                println!("{key}");
            }
            Ok(())
        }
        Commands::Migrate => {
            require_session(&mgr).await?;
            let report = mgr.migrate().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Rotate => {
            let password = prompt_password_once("Master password: ", PASSWORD_ENV)?;
            let report = mgr.rotate_master_key(&password).await?;
            print_rotation(&report)
        }
        Commands::ChangePassword => change_password_command(&mgr).await,
        Commands::Status => status_command(&mgr).await,
    }
}

fn open_vault(data_dir_override: Option<PathBuf>) -> Result<MasterPasswordManager> {
    let dir = match data_dir_override {
        Some(dir) => dir,
        None => data_dir()?,
    };
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let settings = VaultSettings::load(settings_path(&dir)).context("load settings")?;
    let store = FileStore::open(store_path(&dir)).context("open record store")?;
    info!(path = %store.path().display(), "vault opened");
    Ok(MasterPasswordManager::new(Arc::new(store), settings))
}

/// Unlock when a master password exists. Plaintext vaults need no session.
async fn require_session(mgr: &MasterPasswordManager) -> Result<()> {
    match mgr.state().await? {
        ManagerState::Unlocked => Ok(()),
        ManagerState::Uninitialized => {
            warn!("no master password set; records are stored unencrypted");
            Ok(())
        }
        ManagerState::Locked => {
            let minutes = mgr.check_lockout_status().lockout_minutes.unwrap_or(1);
            bail!("too many failed attempts; try again in {minutes} minute(s)")
        }
        ManagerState::PasswordSet => {
            let password = prompt_password_once("Master password: ", PASSWORD_ENV)?;
            let rotation = mgr.unlock(&password).await?;
            if rotation.needs_rotation {
                eprintln!("master key rotation is required; run `credvault rotate`");
            } else if rotation.warning {
                eprintln!("master key rotation due in {} day(s)", rotation.days_until_needed);
            }
            Ok(())
        }
    }
}

async fn init_command(mgr: &MasterPasswordManager) -> Result<()> {
    if mgr.state().await? != ManagerState::Uninitialized {
        bail!("master password already set; use change-password");
    }
    let password = prompt_password_twice("Create master password: ", PASSWORD_ENV)?;
    let report = mgr.set_master_password(&password).await?;
    println!(
        "master password set; {} record(s) encrypted, {} left as plaintext",
        report.migrated.len(),
        report.skipped.len()
    );
    for failure in &report.failures {
        eprintln!("failed to encrypt {}: {}", failure.key, failure.reason);
    }
    Ok(())
}

async fn set_command(mgr: &MasterPasswordManager, key: &str, value: Option<String>) -> Result<()> {
    let value = match value {
        Some(v) => Zeroizing::new(v.into_bytes()),
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf).context("read value from stdin")?;
            Zeroizing::new(buf)
        }
    };
    require_session(mgr).await?;
    mgr.set(key, &value).await?;
    println!("stored {key}");
    Ok(())
}

async fn get_command(mgr: &MasterPasswordManager, key: &str) -> Result<()> {
    require_session(mgr).await?;
    let value = mgr
        .get(key)
        .await?
        .ok_or_else(|| anyhow!("no readable record named {key}"))?;
    match serde_json::from_slice::<serde_json::Value>(&value) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", String::from_utf8_lossy(&value)),
    }
    Ok(())
}

async fn change_password_command(mgr: &MasterPasswordManager) -> Result<()> {
    let current = prompt_password_once("Current master password: ", PASSWORD_ENV)?;
    let new = prompt_password_twice("New master password: ", NEW_PASSWORD_ENV)?;
    let report = mgr.change_master_password(&current, &new).await?;
    print_rotation(&report)
}

async fn status_command(mgr: &MasterPasswordManager) -> Result<()> {
    let state = mgr.state().await?;
    let rotation = match state {
        ManagerState::Uninitialized => None,
        _ => Some(mgr.check_rotation_status().await?),
    };
    let status = serde_json::json!({
        "state": state,
        "records": mgr.keys().await?.len(),
        "lockout": mgr.check_lockout_status(),
        "rotation": rotation,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn print_rotation(report: &RotationReport) -> Result<()> {
    println!("{} record(s) re-encrypted", report.rotated.len());
    for failure in &report.failures {
        eprintln!("not re-encrypted: {} ({})", failure.key, failure.reason);
    }
    Ok(())
}

fn prompt_password_once(prompt: &str, env: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var(env) {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    let pw = rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))?;
    Ok(Zeroizing::new(pw))
}

fn prompt_password_twice(prompt: &str, env: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var(env) {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    let first = prompt_password_once(prompt, env)?;
    let second = Zeroizing::new(
        rpassword::prompt_password("Confirm password: ").map_err(|e| anyhow!("password prompt: {e}"))?,
    );
    if *first != *second {
        bail!("passwords do not match");
    }
    Ok(first)
}
