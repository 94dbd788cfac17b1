//! keeper: encrypted file vault client
//!
//! Local commands:
//!   encrypt -i <file> -o <name>   - encrypt a file into the vault
//!   decrypt -i <name> -o <file>   - decrypt a vault blob to a file
//!   card --number .. --date .. --cvv ..  - store a payment card
//!   list                          - list vault contents
//!   config show                   - print the effective configuration
//!
//! Server commands:
//!   register, login, upload, download, delete, sync

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use keeper_core::KeeperConfig;
use keeper_storage::{store_card, Card, StorageLayout, TokenStore, TransferOptions, VaultRepository};
use keeper_sync::{CheckpointStore, HttpRemote, RemoteVault, SyncReconciler, UploadMeta};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "keeper",
    version,
    about = "Encrypted file vault client",
    long_about = "keeper: encrypt files into a local vault and keep it in sync with a keeper server"
)]
struct Cli {
    /// Path to keeper.toml configuration file
    #[arg(long, short = 'c', env = "KEEPER_CONFIG", default_value = "keeper.toml")]
    config: PathBuf,

    /// Log filter, e.g. "info" or "keeper_sync=debug" (overrides config)
    #[arg(long, env = "KEEPER_LOG", global = true)]
    log: Option<String>,

    /// Log output format (overrides config)
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,

    /// Server API base URL (overrides config)
    #[arg(long = "server", short = 'a', env = "KEEPER_SERVER", global = true)]
    server: Option<String>,

    /// Account name; selects the vault under <storage>/files/<username>
    #[arg(long, short = 'u', env = "KEEPER_USERNAME", global = true)]
    username: Option<String>,

    /// Password (prompted when omitted)
    #[arg(long, short = 'p', env = "KEEPER_PASSWORD", global = true, hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an account on the server
    Register {
        #[arg(long, short = 'e')]
        email: String,
    },

    /// Log in and store the bearer token locally
    Login,

    /// Encrypt a local file into the vault
    Encrypt {
        /// File to encrypt
        #[arg(long, short = 'i')]
        input: PathBuf,
        /// Vault name (default: the input file name)
        #[arg(long, short = 'o')]
        output: Option<String>,
    },

    /// Decrypt a vault blob to a local file
    Decrypt {
        /// Vault name
        #[arg(long, short = 'i')]
        input: String,
        /// Destination path
        #[arg(long, short = 'o')]
        output: PathBuf,
    },

    /// Upload a vault blob to the server
    Upload {
        /// Vault name
        #[arg(long, short = 'i')]
        input: String,
        #[arg(long, default_value = "")]
        category: String,
        #[arg(long, default_value = "")]
        description: String,
    },

    /// Download a blob from the server into the vault
    Download {
        /// Remote name
        #[arg(long, short = 'i')]
        input: String,
    },

    /// Delete a blob on the server and in the vault
    Delete {
        /// Vault name
        #[arg(long, short = 'i')]
        input: String,
    },

    /// List vault contents
    List,

    /// Store a payment card as an encrypted JSON document
    Card {
        #[arg(long)]
        number: String,
        /// Expiry, e.g. 12/29
        #[arg(long)]
        date: String,
        #[arg(long)]
        cvv: String,
    },

    /// Reconcile the vault with the server
    Sync,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(&cli.config).await?;
    if let Some(server) = &cli.server {
        config.client.server_address = server.clone();
    }
    if let Some(format) = cli.log_format {
        config.client.log_format = match format {
            LogFormat::Text => "text".into(),
            LogFormat::Json => "json".into(),
        };
    }

    let level = cli.log.clone().unwrap_or_else(|| config.client.log_level.clone());
    init_logging(&level, &config.client.log_format);

    config.validate().context("invalid configuration")?;
    debug!(config = %cli.config.display(), "configuration loaded");

    let ctx = Ctx::new(config, &cli);
    match cli.command {
        Commands::Register { email } => cmd_register(&ctx, &email).await,
        Commands::Login => cmd_login(&ctx).await,
        Commands::Encrypt { input, output } => cmd_encrypt(&ctx, &input, output).await,
        Commands::Decrypt { input, output } => cmd_decrypt(&ctx, &input, &output).await,
        Commands::Upload {
            input,
            category,
            description,
        } => {
            cmd_upload(
                &ctx,
                &input,
                UploadMeta {
                    description,
                    category,
                },
            )
            .await
        }
        Commands::Download { input } => cmd_download(&ctx, &input).await,
        Commands::Delete { input } => cmd_delete(&ctx, &input).await,
        Commands::List => cmd_list(&ctx).await,
        Commands::Card { number, date, cvv } => {
            cmd_card(&ctx, Card { number, date, cvv }).await
        }
        Commands::Sync => cmd_sync(&ctx).await,
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&ctx.config, &cli.config),
    }
}

fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn load_config(path: &Path) -> Result<KeeperConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        KeeperConfig::from_toml(&content)
            .with_context(|| format!("parsing config: {}", path.display()))
    } else {
        Ok(KeeperConfig::default())
    }
}

// ── Shared command context ────────────────────────────────────────────────────

struct Ctx {
    config: KeeperConfig,
    layout: StorageLayout,
    username: Option<String>,
    password: Option<String>,
}

impl Ctx {
    fn new(config: KeeperConfig, cli: &Cli) -> Self {
        let layout = StorageLayout::new(config.storage.root.clone())
            .with_kdf_params(config.crypto.kdf_params());
        Self {
            config,
            layout,
            username: cli.username.clone(),
            password: cli.password.clone(),
        }
    }

    fn username(&self) -> Result<&str> {
        self.username
            .as_deref()
            .filter(|u| !u.is_empty())
            .context("username must be set: -u <username>")
    }

    fn password(&self, prompt: &str) -> Result<SecretString> {
        match &self.password {
            Some(p) => Ok(SecretString::from(p.clone())),
            None => rpassword::prompt_password(prompt)
                .map(SecretString::from)
                .context("reading password"),
        }
    }

    async fn vault(&self) -> Result<VaultRepository> {
        let user = self.username()?;
        self.layout
            .open_files(user)
            .await
            .with_context(|| format!("opening vault for {user}"))
    }

    async fn tokens(&self) -> Result<TokenStore> {
        Ok(TokenStore::new(self.layout.open_tokens().await?))
    }

    /// HTTP client without credentials, for register/login.
    fn anonymous_remote(&self) -> Result<HttpRemote> {
        HttpRemote::new(&self.config.client).context("building HTTP client")
    }

    /// HTTP client carrying the stored bearer token.
    async fn remote(&self) -> Result<HttpRemote> {
        let user = self.username()?;
        let token = self
            .tokens()
            .await?
            .load(user)
            .await
            .with_context(|| format!("no session for {user}; run `keeper login` first"))?;
        Ok(self.anonymous_remote()?.with_token(token))
    }
}

// ── Progress helpers ──────────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
    )
    .map(|s| s.progress_chars("=>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Transfer options wired to a progress bar and Ctrl-C.
fn transfer_options(pb: &ProgressBar) -> TransferOptions {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let bar = pb.clone();
    TransferOptions {
        cancel,
        progress: Some(Box::new(move |done: u64| bar.set_position(done))),
    }
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling");
            cancel.cancel();
        }
    });
}

// ── Account commands ──────────────────────────────────────────────────────────

async fn cmd_register(ctx: &Ctx, email: &str) -> Result<()> {
    let user = ctx.username()?;
    let password = ctx.password("New password: ")?;
    ctx.anonymous_remote()?
        .register(user, &password, email)
        .await
        .context("register")?;
    println!("registered {user}");
    Ok(())
}

async fn cmd_login(ctx: &Ctx) -> Result<()> {
    let user = ctx.username()?;
    let password = ctx.password("Password: ")?;
    let token = ctx
        .anonymous_remote()?
        .login(user, &password)
        .await
        .context("login")?;
    ctx.tokens().await?.save(user, &token).await?;
    println!("logged in as {user}");
    Ok(())
}

// ── Local vault commands ──────────────────────────────────────────────────────

async fn cmd_encrypt(ctx: &Ctx, input: &Path, output: Option<String>) -> Result<()> {
    let name = match output {
        Some(name) => name,
        None => input
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
            .with_context(|| format!("cannot derive a vault name from {}", input.display()))?,
    };
    let vault = ctx.vault().await?;
    let password = ctx.password("Vault password: ")?;

    let total = tokio::fs::metadata(input)
        .await
        .with_context(|| format!("stat {}", input.display()))?
        .len();
    let pb = make_progress_bar(total, "encrypt");
    let result = vault
        .encrypt_file_with(input, &name, &password, transfer_options(&pb))
        .await;
    pb.finish_and_clear();

    let bytes = result.with_context(|| format!("encrypting {}", input.display()))?;
    println!("{name}: encrypted {}", HumanBytes(bytes));
    Ok(())
}

async fn cmd_decrypt(ctx: &Ctx, input: &str, output: &Path) -> Result<()> {
    let vault = ctx.vault().await?;
    let password = ctx.password("Vault password: ")?;

    let total = tokio::fs::metadata(vault.get_path(input))
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    let existed = output.exists();
    let pb = make_progress_bar(total, "decrypt");
    let result = vault
        .decrypt_file_with(input, output, &password, transfer_options(&pb))
        .await;
    pb.finish_and_clear();

    match result {
        Ok(bytes) => {
            println!("{}: decrypted {}", output.display(), HumanBytes(bytes));
            Ok(())
        }
        Err(e) => {
            if !existed {
                discard_partial_output(output).await;
            }
            Err(e).with_context(|| format!("decrypting {input}"))
        }
    }
}

/// Remove the verified plaintext prefix a failed decrypt left at `output`.
async fn discard_partial_output(output: &Path) {
    match tokio::fs::remove_file(output).await {
        Ok(()) => debug!(path = %output.display(), "removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %output.display(), "failed to remove partial output: {e}"),
    }
}

async fn cmd_list(ctx: &Ctx) -> Result<()> {
    let vault = ctx.vault().await?;
    let mut files = vault.find_all().await?;
    files.sort_by(|a, b| a.name.cmp(&b.name));

    if files.is_empty() {
        println!("vault is empty");
        return Ok(());
    }
    let width = files.iter().map(|f| f.name.len()).max().unwrap_or(0);
    for file in &files {
        println!("{:<width$}  {:>10}", file.name, HumanBytes(file.size).to_string());
    }
    println!("{} file(s)", files.len());
    Ok(())
}

async fn cmd_card(ctx: &Ctx, card: Card) -> Result<()> {
    let vault = ctx.vault().await?;
    let password = ctx.password("Vault password: ")?;
    let name = store_card(&vault, &card, &password)
        .await
        .context("storing card")?;
    println!("card saved as {name}");
    Ok(())
}

fn cmd_config_show(config: &KeeperConfig, path: &Path) -> Result<()> {
    println!("# config: {}", path.display());
    print!(
        "{}",
        toml::to_string_pretty(config).context("serializing config")?
    );
    Ok(())
}

// ── Server commands ───────────────────────────────────────────────────────────

async fn cmd_upload(ctx: &Ctx, name: &str, meta: UploadMeta) -> Result<()> {
    let vault = ctx.vault().await?;
    if !vault.exists(name).await {
        anyhow::bail!("{name} is not in the vault");
    }
    let remote = ctx.remote().await?;

    let pb = make_spinner("upload");
    pb.set_message(name.to_string());
    let result = remote.upload(&vault.get_path(name), name, &meta).await;
    pb.finish_and_clear();

    let uuid = result.with_context(|| format!("uploading {name}"))?;
    println!("{name}: uploaded as {uuid}");
    Ok(())
}

async fn cmd_download(ctx: &Ctx, name: &str) -> Result<()> {
    let vault = ctx.vault().await?;
    let remote = ctx.remote().await?;

    let pb = make_spinner("download");
    pb.set_message(name.to_string());
    let result: keeper_core::KeeperResult<u64> = async {
        let body = remote.download(name).await?;
        vault.save(name, body).await
    }
    .await;
    pb.finish_and_clear();

    let bytes = result.with_context(|| format!("downloading {name}"))?;
    println!("{name}: downloaded {}", HumanBytes(bytes));
    Ok(())
}

async fn cmd_delete(ctx: &Ctx, name: &str) -> Result<()> {
    let vault = ctx.vault().await?;
    let remote = ctx.remote().await?;

    remote
        .delete(name)
        .await
        .with_context(|| format!("deleting {name} on the server"))?;
    vault
        .delete(name)
        .await
        .with_context(|| format!("deleting {name} locally"))?;
    println!("{name}: deleted");
    Ok(())
}

async fn cmd_sync(ctx: &Ctx) -> Result<()> {
    let user = ctx.username()?;
    let vault = Arc::new(ctx.vault().await?);
    let remote = Arc::new(ctx.remote().await?);
    let checkpoints = CheckpointStore::new(ctx.layout.open_checkpoints().await?);

    let reconciler =
        SyncReconciler::new(vault, remote, checkpoints).with_config(&ctx.config.sync);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let pb = make_spinner("sync");
    pb.set_message(user.to_string());
    let result = reconciler.run(user, &cancel).await;
    pb.finish_and_clear();

    let report = result.context("sync")?;
    println!(
        "sync complete: {} deleted, {} downloaded (checkpoint {})",
        report.deleted,
        report.downloaded,
        report.checkpoint.encode()
    );
    Ok(())
}
