//! token-vault - CLI entry point.

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use token_vault::{config::Config, SettingsStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "token-vault")]
#[command(about = "Keep an OAuth test token local, encrypted in git, and decrypted on CI")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

/// Well-known OAuth endpoints.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Preset {
    Google,
    Github,
}

#[derive(Debug, clap::Args)]
pub struct OAuthArgs {
    /// Use a provider's well-known endpoints
    #[arg(long, value_enum)]
    pub preset: Option<Preset>,

    /// OAuth client id
    #[arg(long)]
    pub client_id: Option<String>,

    /// OAuth client secret (installed-app secrets are not confidential)
    #[arg(long)]
    pub client_secret: Option<String>,

    /// Authorization endpoint
    #[arg(long)]
    pub authorize_url: Option<String>,

    /// Token endpoint
    #[arg(long)]
    pub token_url: Option<String>,

    /// Redirect URI registered for the client
    #[arg(long)]
    pub redirect_uri: Option<String>,

    /// Scope to request (repeatable)
    #[arg(long = "scope")]
    pub scopes: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Obtain a token through the browser and store it locally
    Login {
        #[command(flatten)]
        oauth: OAuthArgs,
    },
    /// Refresh the stored token using its refresh token
    Refresh,
    /// Show artifact, token and branch state
    Status,
    /// Encrypt the token, register its key with CI and update build manifests
    Encrypt {
        /// Do not register the key and IV with the CI provider
        #[arg(long)]
        dry_run: bool,
    },
    /// Decrypt the committed token (run on CI before tests)
    Decrypt {
        /// Exit successfully when the key variables are absent (e.g. fork builds)
        #[arg(long)]
        allow_missing: bool,
    },
    /// Verify ignore lists and CI config are consistent
    Check {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Include or exclude the plaintext token from package builds for a branch
    Package {
        /// Branch to apply (defaults to the current branch)
        #[arg(long)]
        branch: Option<String>,
    },
    /// Inspect or repair the cached CI repository slug
    Slug {
        #[command(subcommand)]
        cmd: SlugCommands,
    },
    /// Discard the local token, log in again and re-encrypt
    Rotate {
        #[command(flatten)]
        oauth: OAuthArgs,

        /// Do not register the key and IV with the CI provider
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum SlugCommands {
    /// Show the slug that would be used
    Show,
    /// Rewrite the cached slug to match the origin remote
    Fix,
    /// Always use this slug, ignoring git config and the remote
    Pin {
        /// Repository slug, e.g. owner/repo
        slug: String,
    },
    /// Remove a pinned slug
    Unpin,
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "token_vault=debug"
    } else {
        "token_vault=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env()?;
    let settings = SettingsStore::new(&config.project_dir).await;

    match cli.command {
        Commands::Login { oauth } => commands::login(&config, &settings, &oauth).await,
        Commands::Refresh => commands::refresh(&config, &settings).await,
        Commands::Status => commands::status(&config, &settings).await,
        Commands::Encrypt { dry_run } => {
            commands::encrypt(&config, &settings, dry_run || config.dry_run).await
        }
        Commands::Decrypt { allow_missing } => {
            commands::decrypt(&config, &settings, allow_missing).await
        }
        Commands::Check { json } => commands::check(&config, &settings, json).await,
        Commands::Package { branch } => commands::package(&config, &settings, branch).await,
        Commands::Slug { cmd } => match cmd {
            SlugCommands::Show => commands::slug_show(&config, &settings).await,
            SlugCommands::Fix => commands::slug_fix(&config).await,
            SlugCommands::Pin { slug } => commands::slug_pin(&settings, Some(slug)).await,
            SlugCommands::Unpin => commands::slug_pin(&settings, None).await,
        },
        Commands::Rotate { oauth, dry_run } => {
            commands::rotate(&config, &settings, &oauth, dry_run || config.dry_run).await
        }
    }
}
