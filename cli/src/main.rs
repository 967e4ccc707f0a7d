mod commands;
mod config;
mod remote;
mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::commands::{
    MigrationTarget, cmd_add, cmd_conflicts_list, cmd_conflicts_resolve, cmd_delete, cmd_edit,
    cmd_list, cmd_migrate_backfill, cmd_migrate_run, cmd_migrate_status, cmd_reset, cmd_stats,
    cmd_sync, cmd_sync_watch,
};
use crate::config::Config;
use crate::remote::HttpRemote;
use feedlog_core::server::{ServerStore, StoreConfig};
use feedlog_core::service::{FeedlogService, SyncMode};

#[derive(Parser)]
#[command(
    name = "feedlog",
    version,
    about = "An offline-first baby feeding tracker",
    long_about = "Log feedings on this device, then sync them with a feedlog server.\n\
                  Works offline; changes queue locally until the next sync."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where to reach the sync server.
#[derive(clap::Args)]
struct ServerArgs {
    /// Server base URL (e.g. http://192.168.1.10:8080)
    #[arg(long = "server", env = "FEEDLOG_SERVER_URL")]
    url: Option<String>,
    /// API key for the server
    #[arg(long, env = "FEEDLOG_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

impl ServerArgs {
    fn remote(self) -> Result<HttpRemote> {
        let url = self
            .url
            .context("No server configured. Pass --server or set FEEDLOG_SERVER_URL.")?;
        HttpRemote::new(&url, self.api_key)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Log a feeding
    Add {
        /// Feeding time (ISO 8601; values without an offset are local time, default: now)
        #[arg(short, long)]
        time: Option<String>,
        /// What was fed (e.g. "formula", "breast milk", "banana")
        #[arg(short, long)]
        food: Option<String>,
        /// Free-form notes
        #[arg(short, long)]
        notes: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Edit a feeding by its client id
    Edit {
        /// Client id of the feeding
        id: String,
        /// New feeding time
        #[arg(short, long)]
        time: Option<String>,
        /// New food type
        #[arg(short, long)]
        food: Option<String>,
        /// New notes
        #[arg(short, long)]
        notes: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a feeding by its client id
    Delete {
        /// Client id of the feeding
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List feedings on this device
    List {
        /// Sort by feeding time: asc or desc
        #[arg(long, default_value = "desc")]
        sort: String,
        /// Maximum number of feedings to show
        #[arg(short, long, default_value = "50")]
        limit: i64,
        /// Number of feedings to skip
        #[arg(long, default_value = "0")]
        offset: i64,
        /// Filter by food type or notes
        #[arg(short, long)]
        search: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show local record, queue and conflict counts
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete all local feedings, queued changes and conflicts
    Reset {
        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Push queued changes and pull remote ones
    Sync {
        #[command(flatten)]
        server: ServerArgs,
        /// Only push queued local changes
        #[arg(long, conflicts_with = "pull_only")]
        push_only: bool,
        /// Only pull remote changes
        #[arg(long)]
        pull_only: bool,
        /// Keep syncing until interrupted
        #[arg(short, long)]
        watch: bool,
        /// Seconds between syncs in watch mode
        #[arg(long, default_value = "60")]
        interval: u64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Review and resolve sync conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Inspect or run the server's client id migration
    Migrate {
        #[command(flatten)]
        server: ServerArgs,
        /// Operate directly on a server database file instead of over HTTP
        #[arg(long, env = "FEEDLOG_DATABASE", value_name = "PATH")]
        database: Option<PathBuf>,
        #[command(subcommand)]
        command: MigrateCommands,
    },
    /// Start the sync server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
        /// Run the client id migration before accepting requests
        #[arg(long)]
        auto_migrate: bool,
        /// Server database file (default: server.db in the data directory)
        #[arg(long, env = "FEEDLOG_DATABASE", value_name = "PATH")]
        database: Option<PathBuf>,
        /// Maximum pooled database connections
        #[arg(long, default_value = "20")]
        max_connections: u32,
        /// Seconds to wait for a pooled connection before answering 503
        #[arg(long, default_value = "2")]
        acquire_timeout: u64,
        /// Seconds before an idle pooled connection is closed
        #[arg(long, default_value = "30")]
        idle_timeout: u64,
    },
}

#[derive(Subcommand)]
enum ConflictCommands {
    /// List conflicts
    List {
        /// Include resolved conflicts
        #[arg(short, long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a conflict by keeping one side
    Resolve {
        /// Conflict number (from `conflicts list`)
        id: Option<i64>,
        /// Which version to keep: local or server
        #[arg(short, long)]
        keep: String,
        /// Resolve every open conflict the same way
        #[arg(long, conflicts_with = "id")]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum MigrateCommands {
    /// Show migration progress
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add the client_id column if needed and backfill every record
    Run {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Assign client ids to records that lack one
    Backfill {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("feedlog=info,feedlog_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn sync_mode(push_only: bool, pull_only: bool) -> SyncMode {
    match (push_only, pull_only) {
        (true, _) => SyncMode::PushOnly,
        (false, true) => SyncMode::PullOnly,
        (false, false) => SyncMode::Full,
    }
}

#[allow(clippy::too_many_lines)]
async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;

    match cli.command {
        Commands::Serve {
            port,
            bind,
            no_auth,
            auto_migrate,
            database,
            max_connections,
            acquire_timeout,
            idle_timeout,
        } => {
            let api_key = if no_auth {
                None
            } else {
                Some(config.load_or_create_api_key()?.0)
            };
            let store_config = StoreConfig {
                max_connections,
                acquire_timeout: Duration::from_secs(acquire_timeout),
                idle_timeout: Duration::from_secs(idle_timeout),
                ..StoreConfig::default()
            };
            let path = database.unwrap_or(config.server_db_path);
            let store = ServerStore::connect(&path, &store_config)
                .await
                .with_context(|| format!("Failed to open server database {}", path.display()))?;
            server::start_server(store, port, &bind, api_key, auto_migrate).await
        }
        Commands::Migrate {
            server,
            database,
            command,
        } => {
            let target = match database {
                Some(path) => {
                    let store = ServerStore::connect(&path, &StoreConfig::default())
                        .await
                        .with_context(|| {
                            format!("Failed to open server database {}", path.display())
                        })?;
                    MigrationTarget::Direct(store)
                }
                None => MigrationTarget::Remote(server.remote()?),
            };
            match command {
                MigrateCommands::Status { json } => cmd_migrate_status(&target, json).await,
                MigrateCommands::Run { json } => cmd_migrate_run(&target, json).await,
                MigrateCommands::Backfill { json } => cmd_migrate_backfill(&target, json).await,
            }
        }
        Commands::Add {
            time,
            food,
            notes,
            json,
        } => cmd_add(&open_device(&config)?, time, food, notes, json),
        Commands::Edit {
            id,
            time,
            food,
            notes,
            json,
        } => cmd_edit(
            &open_device(&config)?,
            &id,
            time.as_deref(),
            food,
            notes,
            json,
        ),
        Commands::Delete { id, json } => cmd_delete(&open_device(&config)?, &id, json),
        Commands::List {
            sort,
            limit,
            offset,
            search,
            json,
        } => cmd_list(&open_device(&config)?, &sort, limit, offset, search, json),
        Commands::Stats { json } => cmd_stats(&open_device(&config)?, json),
        Commands::Reset { yes, json } => cmd_reset(&open_device(&config)?, yes, json),
        Commands::Sync {
            server,
            push_only,
            pull_only,
            watch,
            interval,
            json,
        } => {
            let service = open_device(&config)?;
            let remote = server.remote()?;
            let mode = sync_mode(push_only, pull_only);
            if watch {
                cmd_sync_watch(&service, &remote, mode, Duration::from_secs(interval), json).await
            } else {
                cmd_sync(&service, &remote, mode, json).await
            }
        }
        Commands::Conflicts { command } => {
            let service = open_device(&config)?;
            match command {
                ConflictCommands::List { all, json } => cmd_conflicts_list(&service, all, json),
                ConflictCommands::Resolve {
                    id,
                    keep,
                    all,
                    json,
                } => cmd_conflicts_resolve(&service, id, all, &keep, json),
            }
        }
    }
}

fn open_device(config: &Config) -> Result<FeedlogService> {
    FeedlogService::new(&config.db_path)
        .with_context(|| format!("Failed to open {}", config.db_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sync_mode_from_flags() {
        assert_eq!(sync_mode(false, false), SyncMode::Full);
        assert_eq!(sync_mode(true, false), SyncMode::PushOnly);
        assert_eq!(sync_mode(false, true), SyncMode::PullOnly);
    }

    #[test]
    fn parses_reset() {
        let cli = Cli::try_parse_from(["feedlog", "reset", "--yes"]).unwrap();
        assert!(matches!(cli.command, Commands::Reset { yes: true, json: false }));
        let cli = Cli::try_parse_from(["feedlog", "reset"]).unwrap();
        assert!(matches!(cli.command, Commands::Reset { yes: false, .. }));
    }

    #[test]
    fn parses_conflict_resolution() {
        let cli = Cli::try_parse_from(["feedlog", "conflicts", "resolve", "3", "--keep", "local"])
            .unwrap();
        match cli.command {
            Commands::Conflicts {
                command: ConflictCommands::Resolve { id, keep, all, .. },
            } => {
                assert_eq!(id, Some(3));
                assert_eq!(keep, "local");
                assert!(!all);
            }
            _ => panic!("expected conflicts resolve"),
        }
    }
}
