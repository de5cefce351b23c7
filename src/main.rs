use std::path::PathBuf;

use clap::Parser;
use saml_sp::{
    SamlEngine,
    config::SamlConfig,
    observability,
    resolver::RequestHints,
};

#[derive(Parser, Debug)]
#[command(version, about = "Multi-tenant SAML 2.0 Service Provider", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to config file (defaults to saml-sp.toml in the current directory)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Print the SP metadata a tenant's IdP should be given
    Metadata {
        /// Tenant key
        tenant: String,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Load and validate a configuration file, then exit
    CheckConfig,
    /// Show enabled compile-time features
    Features,
}

/// Resolve the config path, falling back to `saml-sp.toml` in the current
/// directory.
fn resolve_config_path(explicit_path: Option<&str>) -> Result<PathBuf, String> {
    let path = PathBuf::from(explicit_path.unwrap_or("saml-sp.toml"));
    if !path.exists() {
        return Err(format!("Config file not found: {}", path.display()));
    }
    Ok(path)
}

fn load_config(explicit_path: Option<&str>) -> (PathBuf, SamlConfig) {
    let config_path = match resolve_config_path(explicit_path) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let config = match SamlConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!(
                "Failed to load config from {}: {}",
                config_path.display(),
                e
            );
            std::process::exit(1);
        }
    };

    if let Err(e) = observability::init_tracing(&config.observability.logging) {
        eprintln!("Failed to initialize tracing: {e}");
        std::process::exit(1);
    }

    (config_path, config)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Command::Metadata { tenant, output } => {
            run_metadata(args.config.as_deref(), &tenant, output).await;
        }
        Command::CheckConfig => {
            run_check_config(args.config.as_deref()).await;
        }
        Command::Features => {
            run_features();
        }
    }
}

async fn run_metadata(explicit_config_path: Option<&str>, tenant: &str, output: Option<String>) {
    let (_, config) = load_config(explicit_config_path);

    let engine = match SamlEngine::from_config(&config).await {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize SAML engine");
            std::process::exit(1);
        }
    };

    // Tenants that rely on published IdP metadata need it before they resolve
    engine.refresh_metadata().await;

    let ctx = match engine.resolve(&RequestHints::key(tenant)).await {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let xml = engine.metadata(&ctx);

    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(&path, &xml) {
                eprintln!("Failed to write {}: {}", path, e);
                std::process::exit(1);
            }
            tracing::info!(idp_key = %ctx.idp_key, path = %path, "Wrote SP metadata");
        }
        None => println!("{xml}"),
    }
}

async fn run_check_config(explicit_config_path: Option<&str>) {
    let (config_path, config) = load_config(explicit_config_path);

    match SamlEngine::from_config(&config).await {
        Ok(engine) => {
            let tenants = engine.tenants().await.map(|t| t.len()).unwrap_or_default();
            tracing::info!(
                config_file = %config_path.display(),
                tenants,
                "Configuration is valid"
            );
            println!("{}: OK ({} tenants)", config_path.display(), tenants);
        }
        Err(e) => {
            eprintln!("{}: {}", config_path.display(), e);
            std::process::exit(1);
        }
    }
}

fn run_features() {
    let version = env!("CARGO_PKG_VERSION");
    let features: &[(&str, bool)] = &[
        ("cli", cfg!(feature = "cli")),
        ("database-sqlite", cfg!(feature = "database-sqlite")),
        ("telemetry", cfg!(feature = "telemetry")),
    ];

    println!("saml-sp {version}");
    for (name, enabled) in features {
        let mark = if *enabled { "+" } else { "-" };
        println!("  {mark} {name}");
    }
}
