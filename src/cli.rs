use clap::{Parser, Subcommand};
use mediaferry::hash::HashAlgorithm;
use mediaferry::task::TransferInstruction;
use std::net::SocketAddr;

#[derive(Parser, Debug)]
#[command(name = "mediaferry")]
#[command(about = "Media asset transfer, hashing and archival worker", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a worker with its status endpoint until interrupted
    Worker(WorkerArgs),
    /// Digest a single URI and print the hashes
    Hash(HashArgs),
    /// Run an ingest pipeline (transfer, verify) for one object and wait for it
    Ingest(IngestArgs),
}

#[derive(clap::Args, Debug)]
pub struct WorkerArgs {
    /// Overrides `server.bind_addr`
    #[arg(long)]
    pub address: Option<SocketAddr>,
}

#[derive(clap::Args, Debug)]
pub struct HashArgs {
    /// Source URI, e.g. file:///data/clip.mov or s3://bucket/key
    pub uri: String,

    /// Algorithms to compute (MD5, MD5_BASE64, SHA256, TREE_HASH)
    #[arg(long = "algorithm", short = 'a', default_value = "MD5")]
    pub algorithms: Vec<HashAlgorithm>,

    /// First byte to hash
    #[arg(long)]
    pub offset: Option<u64>,

    /// Number of bytes to hash; the rest of the stream when omitted
    #[arg(long)]
    pub length: Option<u64>,
}

#[derive(clap::Args, Debug)]
pub struct IngestArgs {
    #[arg(long)]
    pub object_id: String,

    /// SOURCE=DESTINATION pair, repeatable
    #[arg(long = "transfer", short = 't', value_parser = parse_transfer, required = true)]
    pub transfers: Vec<TransferInstruction>,
}

fn parse_transfer(value: &str) -> Result<TransferInstruction, String> {
    let (source, destination) = value
        .split_once('=')
        .ok_or_else(|| format!("expected SOURCE=DESTINATION, got `{value}`"))?;
    if source.is_empty() || destination.is_empty() {
        return Err(format!("expected SOURCE=DESTINATION, got `{value}`"));
    }
    Ok(TransferInstruction {
        source: source.to_string(),
        destination: destination.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ingest() {
        let cli = Cli::try_parse_from([
            "mediaferry",
            "ingest",
            "--object-id",
            "asset-1",
            "-t",
            "file:///in/a.mov=s3://bucket/a.mov",
        ])
        .unwrap();
        let Commands::Ingest(args) = cli.command else {
            panic!("expected ingest");
        };
        assert_eq!(args.object_id, "asset-1");
        assert_eq!(args.transfers[0].source, "file:///in/a.mov");
        assert_eq!(args.transfers[0].destination, "s3://bucket/a.mov");
    }

    #[test]
    fn test_parse_hash_algorithms() {
        let cli = Cli::try_parse_from([
            "mediaferry",
            "hash",
            "file:///in/a.mov",
            "-a",
            "sha256",
            "-a",
            "tree_hash",
        ])
        .unwrap();
        let Commands::Hash(args) = cli.command else {
            panic!("expected hash");
        };
        assert_eq!(args.algorithms, vec![HashAlgorithm::Sha256, HashAlgorithm::TreeHash]);
    }

    #[test]
    fn test_rejects_malformed_transfer() {
        assert!(parse_transfer("no-separator").is_err());
        assert!(parse_transfer("=s3://b/k").is_err());
    }
}
