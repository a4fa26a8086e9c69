use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use api_key::ApiKeyConfig;
use auth_gateway::configuration::GatewayConfig;
use auth_gateway::keys::{KeyError, KeyManager};
use auth_gateway::metric::Metrics;
use auth_gateway::server::Server;
use auth_gateway::store::{StaticCredential, VaultSecretStore};
use clap::{Args, Parser, Subcommand};
use pingora::server::configuration::Opt;

#[derive(Parser)]
#[command(name = "auth-gateway", about = "API key authorization gateway")]
struct Cli {
    /// Gateway YAML config; environment variables override its values.
    #[arg(short = 'g', long = "gateway-config", env = "AUTH_GATEWAY_CONFIG", global = true)]
    gateway_config: Option<PathBuf>,

    #[command(flatten)]
    pingora: PingoraArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

/// pingora's own server flags, forwarded as its `Opt`.
#[derive(Args)]
struct PingoraArgs {
    /// Take over listening sockets from a running old server.
    #[arg(short, long)]
    upgrade: bool,
    /// Run in the background.
    #[arg(short, long)]
    daemon: bool,
    /// Test the configuration and exit.
    #[arg(short, long)]
    test: bool,
    /// pingora server conf (threads, pid file, grace periods).
    #[arg(short, long)]
    conf: Option<String>,
}

impl From<PingoraArgs> for Opt {
    fn from(args: PingoraArgs) -> Self {
        Opt {
            upgrade: args.upgrade,
            daemon: args.daemon,
            test: args.test,
            conf: args.conf,
            ..Opt::default()
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service (default).
    Serve,
    /// Manage API keys stored in the vault.
    Keys {
        #[command(flatten)]
        target: VaultArgs,

        #[command(subcommand)]
        action: KeysAction,
    },
}

#[derive(Args)]
struct VaultArgs {
    /// Vault base URL.
    #[arg(long, env = "KEY_VAULT_URI", global = true)]
    vault_url: Option<String>,
    /// Bearer credential for the vault.
    #[arg(long, env = "KEY_VAULT_TOKEN", hide_env_values = true, global = true)]
    vault_token: Option<String>,
    /// Token prefix.
    #[arg(long, env = "API_KEY_PREFIX", default_value = api_key::DEFAULT_PREFIX, global = true)]
    prefix: String,
}

#[derive(Subcommand)]
enum KeysAction {
    /// Create a key and store its secret.
    Create {
        /// Key id (6-64 letters, digits, hyphens). Random if omitted.
        #[arg(long)]
        key_id: Option<String>,
        /// Existing full token or bare secret to register.
        #[arg(long)]
        token: Option<String>,
        /// Print the key without writing to the vault.
        #[arg(long)]
        dry_run: bool,
    },
    /// List key ids under the prefix. Secrets are never printed.
    List,
    /// Delete keys by id.
    Revoke {
        #[arg(long = "key-id", required = true)]
        key_ids: Vec<String>,
    },
}

fn init_logging(level: &str) {
    // RUST_LOG wins over the configured level.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn serve(config_path: Option<PathBuf>, opt: Opt) -> ExitCode {
    let config = match GatewayConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            init_logging("info");
            log::error!("failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.log_level);

    let store = match config
        .secret_store
        .as_ref()
        .map(|store| store.build(config.store_timeout()))
    {
        Some(Ok(store)) => store,
        Some(Err(e)) => {
            log::error!("failed to build secret store: {e}");
            return ExitCode::FAILURE;
        }
        None => {
            log::error!("no secret store configured");
            return ExitCode::FAILURE;
        }
    };

    let server = match Server::start(&config, store, Arc::new(Metrics::new()), Some(opt)) {
        Ok(server) => server,
        Err(e) => {
            log::error!("failed to start server: {e}");
            return ExitCode::FAILURE;
        }
    };
    server.run_forever();
    ExitCode::SUCCESS
}

fn vault_manager(target: &VaultArgs) -> Result<KeyManager, String> {
    let url = target
        .vault_url
        .as_deref()
        .filter(|url| !url.trim().is_empty())
        .ok_or("--vault-url or KEY_VAULT_URI is required")?;
    let token = target
        .vault_token
        .as_deref()
        .filter(|token| !token.trim().is_empty())
        .ok_or("--vault-token or KEY_VAULT_TOKEN is required")?;
    let store = VaultSecretStore::new(
        url.trim(),
        Arc::new(StaticCredential::new(token)),
        Duration::from_secs(10),
    )
    .map_err(|e| e.to_string())?;
    Ok(KeyManager::new(
        ApiKeyConfig::new(&target.prefix),
        Arc::new(store),
    ))
}

async fn run_keys(target: VaultArgs, action: KeysAction) -> Result<(), String> {
    let describe = |e: KeyError| e.to_string();

    if let KeysAction::Create {
        key_id,
        token,
        dry_run: true,
    } = &action
    {
        let config = ApiKeyConfig::new(&target.prefix);
        let key = KeyManager::mint(&config, key_id.as_deref(), token.as_deref()).map_err(describe)?;
        print_key(&key);
        return Ok(());
    }

    let manager = vault_manager(&target)?;
    match action {
        KeysAction::Create { key_id, token, .. } => {
            let key = manager
                .create(key_id.as_deref(), token.as_deref())
                .await
                .map_err(describe)?;
            print_key(&key);
        }
        KeysAction::List => {
            for key_id in manager.list().await.map_err(describe)? {
                println!("{key_id}");
            }
        }
        KeysAction::Revoke { key_ids } => {
            let revoked = manager.revoke(&key_ids).await.map_err(describe)?;
            println!("revoked: {}", revoked.join(","));
        }
    }
    Ok(())
}

fn print_key(key: &api_key::GeneratedKey) {
    println!("token:        {}", key.token);
    println!("key id:       {}", key.key_id);
    println!("secret name:  {}", key.secret_name);
    println!("secret value: {}", key.secret);
}

fn keys(target: VaultArgs, action: KeysAction) -> ExitCode {
    init_logging("info");
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run_keys(target, action)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cli.gateway_config, cli.pingora.into()),
        Command::Keys { target, action } => keys(target, action),
    }
}
