use anyhow::Result;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "novel-translator",
    version,
    about = "Distribute novel translation jobs across GPU-backed workers"
)]
struct Cli {
    /// Address the operator API listens on
    #[arg(short = 'a', long = "addr")]
    addr: Option<String>,

    /// Directory for queue, worker registry, library and fail-case state
    #[arg(short = 'd', long = "data-dir")]
    data_dir: Option<String>,

    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "read-settings")]
    read_settings: Option<String>,

    /// Enable verbose logging
    #[arg(long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    novel_translator::logging::init(cli.verbose)?;
    novel_translator::run(novel_translator::Config {
        addr: cli.addr,
        data_dir: cli.data_dir,
        settings_path: cli.read_settings,
    })
    .await
}
