use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use crate::characters::DEFAULT_CHARACTER_ID;
use crate::config::{ClientConfig, RelayConfig};
use crate::error::Result;

#[derive(Parser, Debug)]
#[command(name = "persona-relay")]
#[command(version)]
#[command(about = "Streaming roleplay chat relay and terminal client")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the relay server
    Serve {
        /// TOML config file
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Address to listen on, e.g. 127.0.0.1:8787
        #[arg(long)]
        bind: Option<String>,

        /// Upstream model name
        #[arg(long)]
        model: Option<String>,
    },

    /// Chat with a persona from the terminal
    Chat {
        /// Persona id (luna, kai, nova, drake)
        #[arg(default_value = DEFAULT_CHARACTER_ID)]
        character: String,

        /// Relay endpoint URL
        #[arg(long)]
        endpoint: Option<String>,

        /// TOML config file
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Image to attach to the first message
        #[arg(long)]
        image_url: Option<String>,

        /// Display name prefixed to your messages in a shared conversation
        #[arg(long)]
        name: Option<String>,
    },

    /// List available personas
    Characters,

    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Relay settings for `serve`: file, then `env`, then flags.
pub fn relay_config<F>(
    config: Option<&PathBuf>,
    bind: Option<&str>,
    model: Option<&str>,
    env: F,
) -> Result<RelayConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg = RelayConfig::load(config.map(PathBuf::as_path))?.apply_env(env);
    if let Some(bind) = bind {
        cfg.bind = bind.to_string();
    }
    if let Some(model) = model {
        cfg.model = model.to_string();
    }
    Ok(cfg)
}

/// Client settings for `chat`: file, then `env`, then flags.
pub fn client_config<F>(config: Option<&PathBuf>, endpoint: Option<&str>, env: F) -> Result<ClientConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg = ClientConfig::load(config.map(PathBuf::as_path))?.apply_env(env);
    if let Some(endpoint) = endpoint {
        cfg.endpoint = endpoint.to_string();
    }
    Ok(cfg)
}

pub fn write_completions(shell: Shell, out: &mut dyn std::io::Write) {
    let mut cmd = Args::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, out);
}
