mod server;

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{CommandFactory, Parser, Subcommand, error::ErrorKind};
use dotenvy::dotenv;
use tenant_gate::{
    CleanupAction, CredentialPool, ImportEntry, PoolError, ResolverConfig, preview_token,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about = "Credential pool with per-tenant endpoint discovery")]
struct Cli {
    /// SQLite database path or `sqlite:` URL holding the credential pool.
    #[arg(long, global = true, env = "TENANT_GATE_DATABASE_URL")]
    database: Option<String>,

    #[command(flatten)]
    resolver: ResolverArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the admin HTTP server.
    Serve(ServeArgs),
    /// Import credentials from a file, one `token [endpoint]` per line.
    Import {
        file: PathBuf,
    },
    /// Probe candidate endpoints for one credential.
    Check {
        token: String,
    },
    /// Probe every credential that is not disabled.
    CheckAll,
    /// Print the credential the next request would get.
    Pick,
    /// Run a maintenance action: usage_stats, daily_usage, all_tokens or expired_data.
    Cleanup {
        action: CleanupAction,
    },
    /// Write default values into credentials created before a field existed.
    Backfill,
}

#[derive(Debug, Parser)]
struct ServeArgs {
    /// Address to bind the admin server to.
    #[arg(long, env = "TENANT_GATE_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Port to bind the admin server to.
    #[arg(long, env = "TENANT_GATE_PORT", default_value_t = 27080)]
    port: u16,

    /// Bearer token required by the admin API.
    #[arg(long, env = "TENANT_GATE_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,
}

#[derive(Debug, clap::Args)]
struct ResolverArgs {
    /// Per-probe timeout in seconds.
    #[arg(long, global = true, env = "TENANT_GATE_PROBE_TIMEOUT_SECS", default_value_t = 30)]
    probe_timeout_secs: u64,

    /// How many credentials check-all probes at once.
    #[arg(long, global = true, env = "TENANT_GATE_SWEEP_CONCURRENCY", default_value_t = 10)]
    sweep_concurrency: usize,

    /// Outbound proxy for probe requests.
    #[arg(long, global = true, env = "TENANT_GATE_PROXY_URL")]
    proxy_url: Option<String>,

    /// Replace the built-in candidate endpoints (comma separated or repeated).
    #[arg(
        long = "candidate",
        global = true,
        value_delimiter = ',',
        env = "TENANT_GATE_CANDIDATES"
    )]
    candidates: Vec<String>,
}

impl ResolverArgs {
    fn config(&self) -> ResolverConfig {
        let mut config = ResolverConfig::default();
        let candidates: Vec<String> = self
            .candidates
            .iter()
            .map(|candidate| candidate.trim().to_owned())
            .filter(|candidate| !candidate.is_empty())
            .collect();
        if !candidates.is_empty() {
            config.candidates = candidates;
        }
        ResolverConfig {
            probe_timeout: Duration::from_secs(self.probe_timeout_secs.max(1)),
            sweep_concurrency: self.sweep_concurrency,
            proxy_url: self.proxy_url.clone(),
            ..config
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    // `global` arguments cannot be marked required, so enforce it here.
    let Some(database) = cli.database.as_deref().filter(|db| !db.trim().is_empty()) else {
        Cli::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                "--database <DATABASE> (or TENANT_GATE_DATABASE_URL) is required",
            )
            .exit();
    };

    let pool = match CredentialPool::open(database, cli.resolver.config()).await {
        Ok(pool) => pool,
        Err(err) => {
            report_error(&err);
            std::process::exit(1);
        }
    };

    match cli.command {
        Command::Serve(args) => run_server(args, pool).await?,
        command => {
            if let Err(err) = run_command(command, &pool).await {
                report_error(&err);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn run_server(args: ServeArgs, pool: CredentialPool) -> Result<(), Box<dyn std::error::Error>> {
    if args.admin_token.as_deref().is_none_or(|token| token.trim().is_empty()) {
        tracing::warn!("no admin token configured, admin API will refuse every request");
    }
    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    server::serve(addr, pool, server::AdminAuth::new(args.admin_token)).await
}

async fn run_command(command: Command, pool: &CredentialPool) -> Result<(), PoolError> {
    match command {
        Command::Serve(_) => {}
        Command::Import { file } => {
            let text = match std::fs::read_to_string(&file) {
                Ok(text) => text,
                Err(err) => {
                    eprintln!("error: cannot read {}: {err}", file.display());
                    std::process::exit(1);
                }
            };
            let entries = ImportEntry::parse_lines(&text);
            let report = pool.import_credentials(&entries).await?;
            println!(
                "imported {} credential(s), {} already present",
                report.created, report.skipped
            );
        }
        Command::Check { token } => {
            let resolution = pool.resolve_endpoint(token.trim()).await?;
            print_json(&resolution);
        }
        Command::CheckAll => {
            let report = pool.resolve_all().await?;
            print_json(&report);
        }
        Command::Pick => {
            let selection = pool.select_credential().await?;
            println!(
                "{} -> {}",
                preview_token(&selection.token),
                selection.tenant_endpoint
            );
        }
        Command::Cleanup { action } => {
            let cleaned = pool.cleanup(action).await?;
            println!("{action}: removed {cleaned} entr(ies)");
        }
        Command::Backfill => {
            let updated = pool.backfill_defaults().await?;
            println!("backfilled {updated} credential(s)");
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize + std::fmt::Debug>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(pretty) => println!("{pretty}"),
        Err(_) => println!("{value:?}"),
    }
}

fn report_error(err: &PoolError) {
    eprintln!("error: {err}");
    match err {
        PoolError::Persistence(db_err) => {
            eprintln!("  database: {db_err}");
        }
        PoolError::HttpClient(source) => {
            eprintln!("  http client: {source}");
        }
        PoolError::Malformed { key, .. } => {
            eprintln!("  stored value at {key} needs repair");
        }
        _ => {}
    }
}
