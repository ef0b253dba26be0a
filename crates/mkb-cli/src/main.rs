mod config;
mod handlers;
mod serve_cmd;
#[cfg(test)]
mod test_util;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use config::MkbConfig;

#[derive(Parser)]
#[command(
    name = "mkb",
    about = "Multi-tenant knowledge-base gateway with stepwise plan execution"
)]
struct Cli {
    /// Config file (defaults to $XDG_CONFIG_HOME/mkb/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a template config file
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the HTTP gateway
    Serve {
        /// Address to bind (overrides MKB_BIND and the config file)
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (overrides MKB_PORT and the config file)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            let path = cli.config.unwrap_or_else(config::config_path);
            cmd_init(&path, force)?;
        }
        Commands::Serve { bind, port } => {
            let config = MkbConfig::resolve(cli.config.as_deref(), bind.as_deref(), port)?;
            serve_cmd::run_serve(config).await?;
        }
    }

    Ok(())
}

fn cmd_init(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile::default();
    config::save_config(&cfg, path)?;

    println!("Config written to {}", path.display());
    println!("  server = {}:{}", cfg.server.bind, cfg.server.port);
    println!("  knowledge_base.domain = {}", cfg.knowledge_base.domain);
    println!("  storage.endpoint = {}", cfg.storage.endpoint);
    println!();
    println!("Fill in storage.bucket and the access/secret keys (or set MKB_KB_ACCESS_KEY,");
    println!("MKB_KB_SECRET_KEY, MKB_TOS_ACCESS_KEY, MKB_TOS_SECRET_KEY).");
    println!("Next: run `mkb serve`");

    Ok(())
}
