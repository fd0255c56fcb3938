use std::process;

use clap::{Parser, Subcommand};
use metaapp::chain::ChainKind;
use metaapp::deploy::request_redeploy;
use metaapp::initialize_store;
use metaapp::service::Service;
use metaapp::utils::Context;

use crate::config::generator::generate_config;
use crate::config::ConfigFile;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Opts {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum Command {
    /// Generate a new configuration file
    #[clap(subcommand)]
    Config(ConfigCommand),
    /// Stream blocks and index MetaApp inscriptions
    #[clap(subcommand)]
    Service(ServiceCommand),
    /// Inspect and maintain the local indexer databases
    #[clap(subcommand)]
    Db(DbCommand),
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum ConfigCommand {
    /// Generate new config
    #[clap(name = "new", bin_name = "new")]
    New(NewConfig),
}

#[derive(Parser, PartialEq, Clone, Debug)]
struct NewConfig {
    /// Target the btc chain
    #[clap(long = "btc", conflicts_with = "mvc")]
    pub btc: bool,
    /// Target the mvc chain
    #[clap(long = "mvc", conflicts_with = "btc")]
    pub mvc: bool,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum ServiceCommand {
    /// Catch up with the chain tip, then stream blocks and mempool
    #[clap(name = "start", bin_name = "start")]
    Start(StartCommand),
}

#[derive(Parser, PartialEq, Clone, Debug)]
struct StartCommand {
    /// Target Devnet network
    #[clap(
        long = "devnet",
        conflicts_with = "mainnet",
        conflicts_with = "config_path"
    )]
    pub devnet: bool,
    /// Target Mainnet network
    #[clap(
        long = "mainnet",
        conflicts_with = "devnet",
        conflicts_with = "config_path"
    )]
    pub mainnet: bool,
    /// Load config file path
    #[clap(
        long = "config-path",
        conflicts_with = "devnet",
        conflicts_with = "mainnet"
    )]
    pub config_path: Option<String>,
    /// Override the first block height to scan
    #[clap(long = "start-height")]
    pub start_height: Option<u64>,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum DbCommand {
    /// List indexed apps, newest first
    #[clap(name = "apps", bin_name = "apps")]
    Apps(DbListCommand),
    /// List outstanding deploy queue items
    #[clap(name = "queue", bin_name = "queue")]
    Queue(DbListCommand),
    /// Show per-chain sync cursors
    #[clap(name = "sync-status", bin_name = "sync-status")]
    SyncStatus(DbConfigCommand),
    /// Requeue the deployment of an indexed pin
    #[clap(name = "redeploy", bin_name = "redeploy")]
    Redeploy(RedeployCommand),
}

#[derive(Parser, PartialEq, Clone, Debug)]
struct DbListCommand {
    /// Pagination cursor
    #[clap(long = "cursor", default_value = "0")]
    pub cursor: i64,
    /// Page size
    #[clap(long = "size", default_value = "20")]
    pub size: usize,
    /// Load config file path
    #[clap(long = "config-path")]
    pub config_path: Option<String>,
}

#[derive(Parser, PartialEq, Clone, Debug)]
struct DbConfigCommand {
    /// Load config file path
    #[clap(long = "config-path")]
    pub config_path: Option<String>,
}

#[derive(Parser, PartialEq, Clone, Debug)]
struct RedeployCommand {
    /// Pin id of the version to redeploy
    pub pin_id: String,
    /// Load config file path
    #[clap(long = "config-path")]
    pub config_path: Option<String>,
}

pub fn main() {
    let logger = hiro_system_kit::log::setup_logger();
    let _guard = hiro_system_kit::log::setup_global_logger(logger.clone());
    let ctx = Context::with_logger(logger);

    let opts: Opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            println!("{}", e);
            process::exit(1);
        }
    };

    if let Err(e) = handle_command(opts, &ctx) {
        error!(ctx.expect_logger(), "{e}");
        std::thread::sleep(std::time::Duration::from_millis(500));
        process::exit(1);
    }
}

fn handle_command(opts: Opts, ctx: &Context) -> Result<(), String> {
    match opts.command {
        Command::Config(ConfigCommand::New(cmd)) => {
            use std::fs::File;
            use std::io::Write;
            let chain = if cmd.btc {
                ChainKind::Btc
            } else {
                ChainKind::Mvc
            };
            let config_content = generate_config(&chain);
            let mut file_path = std::env::current_dir().expect("unable to get current dir");
            file_path.push("Metaapp.toml");
            let mut file = File::create(&file_path)
                .map_err(|e| format!("unable to open file {}: {}", file_path.display(), e))?;
            file.write_all(config_content.as_bytes())
                .map_err(|e| format!("unable to write file {}: {}", file_path.display(), e))?;
            println!("Created file Metaapp.toml");
        }
        Command::Service(ServiceCommand::Start(cmd)) => {
            let mut config = ConfigFile::default(cmd.devnet, cmd.mainnet, &cmd.config_path)?;
            if cmd.start_height.is_some() {
                config.indexer.start_height = cmd.start_height;
            }
            let service = Service::new(config, ctx.clone());
            return service.run();
        }
        Command::Db(DbCommand::Apps(cmd)) => {
            let config = ConfigFile::default(false, false, &cmd.config_path)?;
            let store = initialize_store(&config, ctx)?;
            let (apps, next_cursor) = store.list_by_time(cmd.cursor, cmd.size)?;
            for app in apps.iter() {
                let encoded = serde_json::to_string(app)
                    .map_err(|e| format!("unable to encode record: {}", e))?;
                println!("{}", encoded);
            }
            println!(
                "{} app(s) ({} total), next cursor: {}",
                apps.len(),
                store.count_apps()?,
                next_cursor
            );
        }
        Command::Db(DbCommand::Queue(cmd)) => {
            let config = ConfigFile::default(false, false, &cmd.config_path)?;
            let store = initialize_store(&config, ctx)?;
            let (items, next_cursor) = store.list_queue(cmd.cursor, cmd.size)?;
            for item in items.iter() {
                let encoded = serde_json::to_string(item)
                    .map_err(|e| format!("unable to encode queue item: {}", e))?;
                println!("{}", encoded);
            }
            println!("{} item(s), next cursor: {}", items.len(), next_cursor);
        }
        Command::Db(DbCommand::SyncStatus(cmd)) => {
            let config = ConfigFile::default(false, false, &cmd.config_path)?;
            let store = initialize_store(&config, ctx)?;
            for cursor in store.get_all_sync_cursors()?.iter() {
                println!(
                    "{}: height {} (updated at {})",
                    cursor.chain_name, cursor.current_sync_height, cursor.updated_at
                );
            }
        }
        Command::Db(DbCommand::Redeploy(cmd)) => {
            let config = ConfigFile::default(false, false, &cmd.config_path)?;
            let store = initialize_store(&config, ctx)?;
            request_redeploy(&store, &cmd.pin_id)?;
            info!(
                ctx.expect_logger(),
                "Deployment of {} requeued", cmd.pin_id
            );
        }
    }
    Ok(())
}
