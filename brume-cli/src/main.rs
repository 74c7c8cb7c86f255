use std::{error::Error, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use brume_client::{Client, HttpServer, ServerHandle};
use brume_core::{
    BlockStore, ClientConfig, ContentHash, Ristretto, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_ROUNDS,
    DIGEST_LEN,
};

#[derive(Parser)]
#[command(
    name = "brume",
    about = "Anonymous block-sharing client: request, serve, and retrieve blocks without any single server learning which is yours.",
    version
)]
struct Cli {
    /// Numeric id used to derive a local listening address for test setups.
    #[arg(short, long, default_value_t = 0)]
    id: u32,

    /// This client's own address; derived from --id when absent.
    #[arg(long)]
    addr: Option<String>,

    /// Server address in the shared server order (repeatable).
    #[arg(long = "server", value_name = "addr", required = true)]
    servers: Vec<String>,

    /// Home server address; defaults to the first server.
    #[arg(long)]
    home: Option<String>,

    /// File to index into the local block store (repeatable).
    #[arg(long = "share", value_name = "path")]
    shares: Vec<PathBuf>,

    /// Content hash to fetch, hex-encoded (repeatable, one per round).
    #[arg(long = "fetch", value_name = "hex")]
    fetch: Vec<String>,

    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    #[arg(long, default_value_t = DEFAULT_MAX_ROUNDS)]
    max_rounds: usize,

    /// How long to wait for the registration barrier before key setup.
    #[arg(long, value_name = "ms", default_value_t = 1000)]
    registration_wait_ms: u64,

    /// Directory downloaded blocks are written into, one file per hash.
    #[arg(long, value_name = "dir")]
    out: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

fn parse_hash(input: &str) -> Result<ContentHash, String> {
    let bytes = hex::decode(input.trim()).map_err(|e| format!("invalid hash hex: {e}"))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| format!("hash must be {DIGEST_LEN} bytes, got {}", bytes.len()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let addr = cli
        .addr
        .clone()
        .unwrap_or_else(|| format!("127.0.0.1:{}", 9000 + cli.id));
    let home = cli.home.clone().unwrap_or_else(|| cli.servers[0].clone());
    let mut config = ClientConfig::new(addr, cli.servers.clone(), home);
    config.block_size = cli.block_size;
    config.max_rounds = cli.max_rounds;

    let wanted = cli
        .fetch
        .iter()
        .map(|h| parse_hash(h))
        .collect::<Result<Vec<_>, String>>()?;

    let mut store = BlockStore::<Ristretto>::new(config.block_size)?;
    for path in &cli.shares {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| format!("share path has no file name: {}", path.display()))?;
        let blocks = store.index_file(name, path)?;
        info!(file = %path.display(), blocks, "indexed into block store");
    }

    let handles: Vec<ServerHandle> = config
        .servers
        .iter()
        .map(|s| Arc::new(HttpServer::new(format!("http://{s}"))) as ServerHandle)
        .collect();

    let client: Client = Client::connect(config, handles, store).await?;
    client.register(0).await?;
    sleep(Duration::from_millis(cli.registration_wait_ms)).await;
    let clients = client.register_done().await?;
    client.share_secrets().await?;
    let slot = client.id().map(|id| id as usize % clients).unwrap_or(0);

    for hash in wanted {
        let (requested, uploaded, downloaded) = tokio::join!(
            client.request_block(slot, hash),
            client.upload(),
            client.download(),
        );
        requested?;
        uploaded?;
        let block = downloaded?;
        if block.is_empty() {
            warn!(hash = %hex::encode(hash), "no peer uploaded this hash; retrieval failed anonymously");
            continue;
        }
        match &cli.out {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let path = dir.join(hex::encode(hash));
                std::fs::write(&path, &block)?;
                info!(path = %path.display(), "block written");
            }
            None => {
                info!(hash = %hex::encode(hash), bytes = block.len(), "block recovered");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::parse_hash;

    #[test]
    fn parses_a_full_digest() {
        let hash = parse_hash(&"ab".repeat(32)).expect("valid");
        assert_eq!(hash, [0xab; 32]);
    }

    #[test]
    fn rejects_short_and_malformed_input() {
        assert!(parse_hash("abcd").is_err());
        assert!(parse_hash("not hex").is_err());
    }
}
