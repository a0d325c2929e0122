use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "ccrelay",
    version,
    about = "Streaming reverse proxy for Anthropic-style LLM providers"
)]
pub struct Args {
    /// Path to the JSON configuration file. Reloaded on SIGHUP.
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Override `server.listen` from the config file.
    #[arg(long)]
    pub listen: Option<String>,
}
