use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

/// Drive the cactus inference engine from the command line.
///
/// Loads the engine and utility libraries the same way an embedding host
/// does, so it doubles as a smoke test for a build of the native libraries.
///
/// EXAMPLES:
///     cactus complete --model qwen.gguf --prompt "Hello"
///     cactus complete --model qwen.gguf --prompt "Hello" --stream
///     cactus device-id
///     cactus register <encrypted-payload>
///
/// ENVIRONMENT VARIABLES:
///     CACTUS_LIBRARY        Engine library name or path
///     CACTUS_UTIL_LIBRARY   Utility library name or path
///     CACTUS_CONTEXT_SIZE   Model context size in tokens
///     CACTUS_BUFFER_SIZE    Response buffer capacity in bytes
///     CACTUS_DATA_DIR       Data directory for device identity
///     RUST_LOG              Log filter (overrides -v)
#[derive(Parser)]
#[command(name = "cactus")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file to use instead of searching for cactus.toml
    #[arg(long, global = true, env = "CACTUS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one completion
    ///
    /// Creates a model, runs the conversation through it and prints the
    /// response. Options default to the [completion] section of the
    /// configuration.
    ///
    /// EXAMPLES:
    ///     cactus complete --model m.gguf --prompt "Hi"
    ///     cactus complete --model m.gguf --messages '[{"role":"user","content":"Hi"}]'
    ///     cactus complete --model m.gguf --prompt "Hi" --stream --raw
    #[command(visible_alias = "c")]
    Complete {
        /// Path to the model file
        #[arg(long, short = 'm')]
        model: String,
        /// Single user message
        #[arg(long, short = 'p', conflicts_with = "messages", required_unless_present = "messages")]
        prompt: Option<String>,
        /// Full conversation as a JSON array of {role, content}
        #[arg(long)]
        messages: Option<String>,
        /// Sampling options as JSON, passed to the engine verbatim
        #[arg(long)]
        options: Option<String>,
        /// Tool definitions as JSON, passed to the engine verbatim
        #[arg(long)]
        tools: Option<String>,
        /// Response buffer capacity in bytes
        #[arg(long)]
        buffer_size: Option<usize>,
        /// Model context size in tokens
        #[arg(long)]
        context_size: Option<u32>,
        /// Print tokens as they are generated
        #[arg(long, short = 's')]
        stream: bool,
        /// Print the raw response buffer instead of the parsed response
        #[arg(long)]
        raw: bool,
    },

    /// Print this device's id
    DeviceId,

    /// Register this app with an encrypted payload
    Register {
        /// Encrypted registration payload
        payload: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // stdout carries responses and streamed tokens
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let mut loader = cactus_config::ConfigLoader::new();
    let config = match &cli.config {
        Some(path) => loader
            .load_from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => loader
            .load_from_directory(&std::env::current_dir()?)
            .context("Failed to load configuration")?,
    };

    match cli.command {
        Commands::Complete {
            model,
            prompt,
            messages,
            options,
            tools,
            buffer_size,
            context_size,
            stream,
            raw,
        } => {
            let args = commands::complete::CompleteArgs {
                model,
                prompt,
                messages,
                options,
                tools,
                buffer_size,
                context_size,
                stream,
                raw,
            };
            commands::complete::run(args, &config)?;
        }
        Commands::DeviceId => {
            commands::device::device_id(&config)?;
        }
        Commands::Register { payload } => {
            commands::device::register(&payload, &config)?;
        }
    }

    Ok(())
}
