use clap::Parser;
use common_base::iterator::AsyncIterator;
use rootfile::riofs::File;
use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Parser)]
#[clap(about, version, author)]
struct Config {
    #[clap(long)]
    pub path: String,

    /// also print the size and date of every key
    #[clap(long, short)]
    pub long: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::parse();
    tracing::debug!("config: {:?}", config);
    if config.path.is_empty() {
        println!("path MUST not be empty!");
        return Ok(());
    }

    let file = File::open(config.path.as_str()).await?;
    println!("=== [{}] ===", config.path);
    println!("version: {}", file.header().format_version());

    let mut itr = file.root().walk();
    while let Some((path, key)) = itr.try_next().await? {
        if config.long {
            println!(
                "{:<12} {:<32} {:>10} {:>10}  {}",
                key.class(),
                format!("{};{}", path, key.cycle()),
                key.obj_len(),
                key.nbytes(),
                key.title()
            );
        } else {
            println!("{:<12} {};{}\t{:?}", key.class(), path, key.cycle(), key.title());
        }
    }

    file.close().await?;
    Ok(())
}
