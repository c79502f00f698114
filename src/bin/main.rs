use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use credchain::auth::error::{EXIT_AUTH, EXIT_OK};
use credchain::auth::{
    AuthError, AuthManager, AuthenticatorRegistry, Clock, CommandAuthenticator, ConfigError,
    ExportFileHook, IdentityKind, SsoProviderAuthenticator, StepError, SystemClock,
};
use credchain::config::{self, Settings};
use log::{error, info};

#[derive(Parser)]
#[command(name = "credchain")]
#[command(about = "Authenticate through chains of identities with cached credentials", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate as an identity, walking its chain
    Login {
        /// Identity name (defaults to the identity marked `default`)
        identity: Option<String>,
    },

    /// Show cached credentials without authenticating
    Whoami {
        /// Identity name (defaults to the identity marked `default`)
        identity: Option<String>,
    },

    /// Forget cached credentials
    Logout {
        /// Identity name (defaults to the identity marked `default`)
        #[arg(conflicts_with = "all")]
        identity: Option<String>,

        /// Forget every declared identity
        #[arg(long)]
        all: bool,
    },

    /// Print the root-to-target chain of an identity
    Chain {
        /// Identity name (defaults to the identity marked `default`)
        identity: Option<String>,
    },

    /// List declared identities
    List,

    /// Print shell exports describing an identity
    Env {
        /// Identity name (defaults to the identity marked `default`)
        identity: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();
    process::exit(run(cli.command).await);
}

async fn run(command: Commands) -> i32 {
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            return e.exit_code();
        }
    };
    let manager = match build_manager(&settings) {
        Ok(manager) => manager,
        Err(e) => {
            error!("{}", e);
            return e.exit_code();
        }
    };

    match command {
        Commands::Login { identity } => {
            let identity = match target(&manager, identity) {
                Ok(identity) => identity,
                Err(e) => return report(&e.into()),
            };
            let result = match settings.timeout {
                Some(timeout) => manager.authenticate_within(&identity, timeout).await,
                None => manager.authenticate(&identity).await,
            };
            match result {
                Ok(credentials) => {
                    println!(
                        "Authenticated as {} (expires {}, {:?})",
                        credentials.owner(),
                        credentials.expires_at().to_rfc3339(),
                        credentials.issued_via()
                    );
                    EXIT_OK
                }
                Err(e) => report(&e),
            }
        }
        Commands::Whoami { identity } => {
            let cached = target(&manager, identity).and_then(|identity| {
                manager
                    .cached_credentials(&identity)
                    .map(|cached| (identity, cached))
            });
            match cached {
                Ok((_, Some(credentials))) => {
                    println!(
                        "{} (expires {})",
                        credentials.owner(),
                        credentials.expires_at().to_rfc3339()
                    );
                    EXIT_OK
                }
                Ok((identity, None)) => {
                    println!("Not authenticated as {}", identity);
                    EXIT_AUTH
                }
                Err(e) => report(&e.into()),
            }
        }
        Commands::Logout { all: true, .. } => {
            manager.logout_all();
            EXIT_OK
        }
        Commands::Logout { identity, .. } => {
            match target(&manager, identity).and_then(|identity| manager.logout(&identity)) {
                Ok(()) => EXIT_OK,
                Err(e) => report(&e.into()),
            }
        }
        Commands::Chain { identity } => {
            match target(&manager, identity).and_then(|identity| manager.chain_for(&identity)) {
                Ok(chain) => {
                    println!("{}", chain);
                    EXIT_OK
                }
                Err(e) => report(&e.into()),
            }
        }
        Commands::List => {
            for identity in manager.list_identities() {
                let marker = if identity.default { " (default)" } else { "" };
                match identity.parent.as_deref() {
                    Some(parent) => {
                        println!("{}\t{}\t{}{}", identity.name, identity.kind, parent, marker)
                    }
                    None => println!("{}\t{}{}", identity.name, identity.kind, marker),
                }
            }
            EXIT_OK
        }
        Commands::Env { identity } => {
            match target(&manager, identity).and_then(|identity| manager.environment(&identity)) {
                Ok(env) => {
                    for (key, value) in env {
                        println!("export {}={}", key, shell_quote(&value));
                    }
                    EXIT_OK
                }
                Err(e) => report(&e.into()),
            }
        }
    }
}

/// The named identity, or the configured default when none was given.
fn target(manager: &AuthManager, identity: Option<String>) -> Result<String, ConfigError> {
    match identity {
        Some(identity) => Ok(identity),
        None => manager.default_identity(),
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn build_manager(settings: &Settings) -> Result<AuthManager, config::SettingsError> {
    let graph = config::load_graph(&settings.config_path)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = settings.credential_store(clock.clone());
    let sso_cache = Arc::new(settings.sso_cache(clock.clone()));

    let command = Arc::new(CommandAuthenticator::new());
    let registry = AuthenticatorRegistry::new()
        .register(IdentityKind::Provider, command.clone())
        .register(IdentityKind::User, command.clone())
        .register(IdentityKind::PermissionSet, command.clone())
        .register(IdentityKind::AssumeRole, command.clone())
        .register(
            IdentityKind::SsoProvider,
            Arc::new(SsoProviderAuthenticator::new(sso_cache.clone(), command)),
        );

    info!(
        "Loaded {} identities from {} (store: {})",
        graph.len(),
        settings.config_path.display(),
        settings.store
    );

    let mut manager = AuthManager::new(graph, store, sso_cache, clock, registry)
        .with_retry_policy(settings.retry_policy())
        .with_timing_logs(settings.enable_timing_logs);
    if let Some(dir) = &settings.export_dir {
        manager = manager.with_hook(Arc::new(ExportFileHook::new(dir.clone())));
    }
    Ok(manager)
}

fn report(e: &AuthError) -> i32 {
    error!("{}", e);
    if let AuthError::ChainAuthentication {
        cause: StepError::ProviderRejected { hint, .. },
        ..
    } = e
    {
        eprintln!("hint: {}", hint);
    }
    e.exit_code()
}
