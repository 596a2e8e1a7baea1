//! `fieldcrypt` CLI tool for key management and provisioning.

#![warn(clippy::pedantic, clippy::nursery)]

mod demo;

use anyhow::{bail, Context, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, Subcommand};
use fieldcrypt::config::{EncryptionConfig, DEFAULT_KEY_VAULT_NAMESPACE, DEFAULT_MASTER_KEY_PATH};
use fieldcrypt::key_provider::MasterKeySource;
use fieldcrypt_key_file::FileMasterKeySource;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fieldcrypt")]
#[command(about = "fieldcrypt key management and demo CLI", long_about = None)]
struct Cli {
    /// Key vault namespace as <database>.<collection>
    #[arg(long, global = true, env = "KEY_VAULT_NAMESPACE", default_value = DEFAULT_KEY_VAULT_NAMESPACE)]
    key_vault_namespace: String,

    /// Local master key file
    #[arg(long, global = true, env = "LOCAL_MASTER_KEY_PATH", default_value = DEFAULT_MASTER_KEY_PATH)]
    master_key_path: PathBuf,

    /// Drop and recreate encrypted collections before provisioning
    #[arg(
        long,
        global = true,
        env = "DROP_COLLECTIONS",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new()
    )]
    drop_collections: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the local master key if it does not exist yet
    Keygen {
        /// Fail instead of reusing an existing key file
        #[arg(long)]
        new: bool,
    },
    /// Print the provisioning descriptor of the demo employee schema
    Schema,
    /// Provision the employee collection, seed it and run sample queries
    Demo,
}

impl Cli {
    fn config(&self) -> Result<EncryptionConfig> {
        let config = EncryptionConfig {
            key_vault_namespace: self.key_vault_namespace.clone(),
            master_key_path: self.master_key_path.clone(),
            drop_collections: self.drop_collections,
        };
        config.validate()?;
        Ok(config)
    }
}

fn keygen(config: &EncryptionConfig, new: bool) -> Result<()> {
    let source = FileMasterKeySource::new(&config.master_key_path);
    if source.exists() {
        if new {
            bail!("master key file already exists: {}", source.path().display());
        }
        source.load().context("existing master key file is unusable")?;
        println!("Master key already present at {}", source.path().display());
        return Ok(());
    }
    source.generate()?;
    println!("Master key written to {}", source.path().display());
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.config()?;

    match cli.command {
        Commands::Keygen { new } => keygen(&config, new),
        Commands::Schema => {
            let descriptor = demo::employee_schema()?.provisioning_descriptor();
            println!("{}", serde_json::to_string_pretty(&descriptor.to_document()?)?);
            Ok(())
        }
        Commands::Demo => demo::run(&config),
    }
}
