mod mircat;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "mircat",
    version,
    about = "MirCat - TCP/UDP reverse tunnel relay"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml/.json). If omitted, uses MIRCAT_CONFIG; then auto-detects mircat.toml > mircat.yaml > mircat.yml > config.json from CWD; then falls back to the OS default path (Linux: /etc/mircat/mircat.toml; others: user config dir).
    #[arg(long, env = "MIRCAT_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Role to run, overriding `role` from the config file.
    #[arg(long, value_enum, env = "MIRCAT_ROLE")]
    role: Option<mircat::config::Role>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    mircat::run(cli.config, cli.role).await
}
