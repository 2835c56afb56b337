//! Berth CLI - Component Lifecycle Manager
//!
//! Resolves, fetches, launches, and pins the components of an app, and
//! manages the local artifact cache.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;

use anyhow::{Context, Result};
use berth_components::ComponentError;
use berth_config::{Config, ResolvedConfig};
use clap::{Parser, Subcommand};

mod commands;
mod notifier;
mod theme;

use commands::{ComponentArgs, KindArg, cache, config, data_dir, launch, overrides, publish, resolve};
use theme::Theme;

/// Berth - Component Lifecycle Manager
#[derive(Parser)]
#[command(name = "berth")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Additional configuration file layered above the user config
    #[arg(short, long, global = true, env = "BERTH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show which version a requirement resolves to
    Resolve {
        #[command(flatten)]
        component: ComponentArgs,

        /// Resolve exactly this version, ignoring the requirement
        #[arg(long)]
        force_version: Option<String>,

        /// Check the version history even if the cache has a match
        #[arg(long)]
        refresh: bool,
    },

    /// Resolve and download a component into the cache
    Fetch {
        #[command(flatten)]
        component: ComponentArgs,

        /// Fetch exactly this version, ignoring the requirement
        #[arg(long)]
        force_version: Option<String>,

        /// Check the version history even if the cache has a match
        #[arg(long)]
        refresh: bool,
    },

    /// Launch every component of an app and keep it running until Ctrl-C
    Launch {
        /// Path to the app manifest (JSON)
        manifest: PathBuf,

        /// Data scope: `shared` or a user id
        #[arg(short, long)]
        scope: Option<String>,
    },

    /// Manage the local artifact cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Print the data directory of a component version
    DataDir {
        /// Component id
        component: String,

        /// Component version
        version: String,

        /// Data scope: `shared` or a user id
        #[arg(short, long)]
        scope: Option<String>,
    },

    /// Pin components to specific versions
    Override {
        #[command(subcommand)]
        command: OverrideCommands,
    },

    /// Publish a release into the local content store
    Publish {
        /// Component id
        component: String,

        /// Release version
        version: String,

        /// Executable, tarball, or directory to publish
        artifact: PathBuf,

        /// Component kind
        #[arg(short, long, value_enum, default_value = "backend")]
        kind: KindArg,

        /// Build target (defaults to this host for backends, `any` for frontends)
        #[arg(short, long)]
        target: Option<String>,
    },

    /// View configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List cached artifacts
    List,
    /// Evict least-recently-used artifacts until the cache fits its limit
    Evict,
    /// Remove every cached artifact
    Clear,
    /// Remove one cached artifact
    Remove {
        /// Component id
        component: String,
        /// Component version
        version: String,
        /// Build target (defaults to this host)
        #[arg(short, long)]
        target: Option<String>,
    },
}

#[derive(Subcommand)]
enum OverrideCommands {
    /// Pin a component to a version (takes effect after a restart)
    Request {
        /// Component id
        component: String,
        /// Version to run
        version: String,
        /// Act as this user instead of `$USER`
        #[arg(long = "as")]
        user: Option<String>,
    },
    /// Restart the host so pending pins take effect
    Activate {
        /// Act as this user instead of `$USER`
        #[arg(long = "as")]
        user: Option<String>,
    },
    /// Remove the pin for a component
    Clear {
        /// Component id
        component: String,
        /// Act as this user instead of `$USER`
        #[arg(long = "as")]
        user: Option<String>,
    },
    /// List pins
    List,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show resolved configuration
    Show {
        /// Output format (toml or json)
        #[arg(short, long, default_value = "toml")]
        format: String,
        /// Annotate which layer set each value
        #[arg(long)]
        sources: bool,
    },
    /// Show config file paths being checked
    Paths,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        // Component errors carry their own user-facing wording.
        let message = match err.downcast_ref::<ComponentError>() {
            Some(component_err) => component_err.user_message(),
            None => format!("{err:#}"),
        };
        tracing::debug!(error = ?err, "Command failed");
        eprintln!("{}", Theme::error(&message));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let resolved = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    setup_logging(&resolved, cli.verbose);

    match cli.command {
        Commands::Config { command } => handle_config(&resolved, command),
        command => {
            let manager = commands::open_manager(resolved.config.clone())?;
            handle_command(&manager, &resolved, command).await
        },
    }
}

fn setup_logging(resolved: &ResolvedConfig, verbose: bool) {
    let mut log_config = berth_telemetry::LogConfig::from(&resolved.config.logging);
    // stdout belongs to command output.
    if matches!(log_config.target, berth_telemetry::LogTarget::Stdout) {
        log_config = log_config.with_target(berth_telemetry::LogTarget::Stderr);
    }
    if verbose {
        "debug".clone_into(&mut log_config.level);
    }
    if let Err(e) = berth_telemetry::setup_logging(&log_config) {
        eprintln!("Failed to initialize logging: {e}");
    }
}

async fn handle_command(
    manager: &berth_components::ComponentManager,
    resolved: &ResolvedConfig,
    command: Commands,
) -> Result<()> {
    match command {
        Commands::Resolve {
            component,
            force_version,
            refresh,
        } => resolve::resolve(manager, &component, force_version.as_deref(), refresh).await,
        Commands::Fetch {
            component,
            force_version,
            refresh,
        } => resolve::fetch(manager, &component, force_version.as_deref(), refresh).await,
        Commands::Launch { manifest, scope } => {
            launch::launch(manager, &manifest, scope.as_deref()).await
        },
        Commands::Cache { command } => handle_cache(manager, command),
        Commands::DataDir {
            component,
            version,
            scope,
        } => data_dir::show_data_dir(manager, &component, &version, scope.as_deref()),
        Commands::Override { command } => handle_override(manager, command).await,
        Commands::Publish {
            component,
            version,
            artifact,
            kind,
            target,
        } => {
            publish::publish_release(
                manager,
                &component,
                &version,
                &artifact,
                kind,
                target.as_deref(),
            )
            .await
        },
        Commands::Config { command } => handle_config(resolved, command),
    }
}

fn handle_cache(manager: &berth_components::ComponentManager, command: CacheCommands) -> Result<()> {
    match command {
        CacheCommands::List => {
            cache::list_cache(manager);
            Ok(())
        },
        CacheCommands::Evict => cache::evict_cache(manager),
        CacheCommands::Clear => cache::clear_cache(manager),
        CacheCommands::Remove {
            component,
            version,
            target,
        } => cache::remove_cached(manager, &component, &version, target.as_deref()),
    }
}

async fn handle_override(
    manager: &berth_components::ComponentManager,
    command: OverrideCommands,
) -> Result<()> {
    match command {
        OverrideCommands::Request {
            component,
            version,
            user,
        } => overrides::request_override(manager, &component, &version, user.as_deref()),
        OverrideCommands::Activate { user } => {
            overrides::activate_overrides(manager, user.as_deref()).await
        },
        OverrideCommands::Clear { component, user } => {
            overrides::clear_override(manager, &component, user.as_deref())
        },
        OverrideCommands::List => overrides::list_overrides(manager),
    }
}

fn handle_config(resolved: &ResolvedConfig, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show { format, sources } => config::show_config(resolved, &format, sources),
        ConfigCommands::Paths => config::show_paths(resolved),
    }
}
