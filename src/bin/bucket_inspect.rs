use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use cloud_offload::config;
use cloud_offload::storage::{keys, HttpObjectStorage, KeyMapper, RemoteListing};
use futures::TryStreamExt;

#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print every key, not just the totals
    #[arg(long)]
    keys: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    cloud_offload::init_tracing();
    let args = Args::parse();

    let cfg = config::load(Some(&args.config))?;
    let client = HttpObjectStorage::from_config(&cfg.storage)?;
    let mapper = KeyMapper::new(&cfg.storage.base_prefix, &cfg.storage.public_url);
    let listing = RemoteListing::new(&client, mapper.list_prefix(), cfg.storage.list_page_size);

    let mut originals = 0u64;
    let mut thumbnails = 0u64;
    let mut bytes = 0i64;
    let mut by_dir: BTreeMap<String, u64> = BTreeMap::new();
    let mut entries = listing.entries();
    while let Some(entry) = entries.try_next().await? {
        bytes += entry.size;
        if keys::is_thumbnail(&entry.key) {
            thumbnails += 1;
            continue;
        }
        originals += 1;
        if args.keys {
            println!("{}\t{}", entry.size, entry.key);
        }
        let dir = mapper
            .relative_path(&entry.key)
            .and_then(|rel| rel.rsplit_once('/').map(|(dir, _)| dir.to_string()))
            .unwrap_or_default();
        *by_dir.entry(dir).or_default() += 1;
    }

    println!("Bucket: {} (prefix '{}')", cfg.storage.bucket, mapper.list_prefix());
    println!("Originals: {}", originals);
    println!("Thumbnails: {}", thumbnails);
    println!("Bytes: {}", bytes);
    println!("By directory:");
    for (dir, count) in by_dir {
        let dir = if dir.is_empty() { "." } else { dir.as_str() };
        println!("  {} -> {}", dir, count);
    }
    Ok(())
}
