mod relay;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "tunnelrelay", version, about = "Reverse tunnel relay server")]
struct Cli {
    /// Control-channel listen port. The tunnel (TLS + UDP) port is this plus one.
    #[arg(long, env = "TUNNELRELAY_PORT", default_value_t = 8881)]
    port: u16,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long, env = "TUNNELRELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON instead of text.
    #[arg(long, env = "TUNNELRELAY_LOG_JSON", default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _logging = relay::logging::init(&cli.log_level, cli.log_json)?;
    relay::run(cli.port).await
}
