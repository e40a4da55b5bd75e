use clap::Parser;

/// Real-time monitoring proxy for LLM API traffic.
#[derive(Debug, Parser)]
#[command(name = "livetoken", version, about)]
pub struct Cli {
    /// Configuration file name (extension optional, e.g. "config" finds
    /// config.toml)
    #[arg(short, long, default_value = "config")]
    pub config: String,

    /// Override the listen host
    #[arg(long)]
    pub host: Option<String>,

    /// Override the listen port
    #[arg(long)]
    pub port: Option<u16>,
}
