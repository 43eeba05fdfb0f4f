#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_wraps,
    dead_code
)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

use mirrorbot::{Bot, Config};

/// `mirrorbot` - mirror links to Google Drive from a Telegram chat.
#[derive(Parser, Debug)]
#[command(name = "mirrorbot")]
#[command(version)]
#[command(about = "Telegram bot that mirrors downloads to Google Drive.", long_about = None)]
struct Cli {
    /// Config file to use instead of ~/.mirrorbot/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, overrides RUST_LOG (e.g. `debug`, `mirrorbot=trace`)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the bot
    Run,

    /// Show the resolved configuration with secrets masked
    Config,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Config::load_or_init().context("Failed to load config"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging - --log-level wins over RUST_LOG, defaults to INFO
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::try_new(level).context("Invalid --log-level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let subscriber = fmt::Subscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => {
            if config.telegram.bot_token.is_empty() {
                anyhow::bail!(
                    "No bot token configured. Set telegram.bot_token in {} or MIRRORBOT_BOT_TOKEN.",
                    config.config_path.display()
                );
            }
            let bot = Arc::new(Bot::from_config(config).await?);
            println!("🪞 mirrorbot started");
            println!("   Ctrl+C to stop");
            bot.run().await
        }
        Commands::Config => {
            println!("Config: {}", config.config_path.display());
            println!();
            print!("{}", config.masked_toml()?);
            Ok(())
        }
    }
}
