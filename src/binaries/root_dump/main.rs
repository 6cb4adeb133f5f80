use std::io::Write;

use clap::Parser;
use rootfile::riofs::File;
use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Parser)]
#[clap(about, version, author)]
struct Config {
    #[clap(long)]
    pub path: String,

    /// print the entries of trees and the content of records
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub deep: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    tracing::debug!("config: {:?}", config);
    if config.path.is_empty() {
        println!("path MUST not be empty!");
        return Ok(());
    }

    let file = File::open(config.path.as_str()).await?;
    let mut out = Vec::new();
    writeln!(out, ">>> file[{}]", config.path)?;
    rootfile::dump::dump(&mut out, &file, config.deep).await?;
    std::io::stdout().write_all(&out)?;

    file.close().await?;
    Ok(())
}
