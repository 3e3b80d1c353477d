use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use nixstore::build;
use nixstore::cache::{
    BinaryCacheStore, DiskCache, HttpCacheBackend, LocalCacheBackend, S3CacheBackend,
};
use nixstore::gc::{self, GcOptions};
use nixstore::transfer::FileTransfer;
use nixstore::{LocalStore, Settings};
use nixwire::store_path::StorePath;

#[derive(Parser)]
#[command(author, version, about = "operate on the artifact store")]
struct Cli {
    /// Root directory holding store, state and logs (overrides the
    /// NIX_* environment).
    #[arg(long, env = "NIX_STORE_ROOT")]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a file-system tree, content-addressed by its archive.
    Add {
        path: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// Write the canonical serialization of a valid path to stdout.
    Dump { path: String },
    /// Build a derivation, registering its normal form.
    Normalise { drv: String },
    /// Ensure a derivation's output closure exists.
    Realise { drv: String },
    /// Materialize a store path through substitutes.
    EnsurePath { path: String },
    /// Recompute and check the archive hash of valid paths.
    Verify { paths: Vec<String> },
    /// Delete unreachable paths.
    Gc {
        #[arg(long)]
        max_freed: Option<u64>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Copy a closure to a binary cache.
    Copy {
        #[arg(long)]
        to: String,
        path: String,
    },
    /// Show the path-info record of a store path.
    Info { path: String },
}

fn open_store(cli: &Cli) -> anyhow::Result<Arc<LocalStore>> {
    let settings = match &cli.root {
        Some(root) => Settings::with_root(root),
        None => Settings::from_env(),
    };
    Ok(Arc::new(LocalStore::open(settings)?))
}

fn parse_path(store: &LocalStore, s: &str) -> anyhow::Result<StorePath> {
    if s.starts_with('/') {
        Ok(store.settings.store_dir.parse_path(s)?)
    } else {
        Ok(s.parse()?)
    }
}

async fn open_cache(store: &LocalStore, url: &str) -> anyhow::Result<BinaryCacheStore> {
    let settings = &store.settings;
    let disk_cache = Arc::new(DiskCache::open(
        &settings.disk_cache_path(),
        settings.ttl_positive_nar_info,
        settings.ttl_negative_nar_info,
    )?);

    let backend: Box<dyn nixstore::cache::CacheBackend> = if let Some(dir) =
        url.strip_prefix("file://")
    {
        Box::new(LocalCacheBackend::new(dir)?)
    } else if url.starts_with("http://") || url.starts_with("https://") {
        let transfer = Arc::new(FileTransfer::new(settings)?);
        Box::new(HttpCacheBackend::new(url::Url::parse(url)?, transfer))
    } else if url.starts_with("s3://") {
        Box::new(S3CacheBackend::new(&url::Url::parse(url)?)?)
    } else {
        anyhow::bail!("unsupported cache URL {url}");
    };

    let mut signing_keys = vec![];
    for file in &settings.secret_key_files {
        let contents = std::fs::read_to_string(file)?;
        signing_keys.push(nixwire::narinfo::SigningKey::parse(contents.trim())?);
    }
    let trusted_keys = store.trusted_keys().to_vec();

    Ok(BinaryCacheStore::open(backend, settings, Some(disk_cache), signing_keys, trusted_keys)
        .await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let store = open_store(&cli)?;

    match cli.command {
        Command::Add { path, name } => {
            let name = match name {
                Some(name) => name,
                None => path
                    .file_name()
                    .context("path has no file name; use --name")?
                    .to_string_lossy()
                    .into_owned(),
            };
            let store_path = store.add_path_to_store(&name, &path)?;
            println!("{}", store.settings.store_dir.display_path(&store_path));
        }

        Command::Dump { path } => {
            let path = parse_path(&store, &path)?;
            let stdout = std::io::stdout();
            store.nar_from_path(&path, &mut stdout.lock())?;
        }

        Command::Normalise { drv } => {
            let drv = parse_path(&store, &drv)?;
            let nf = build::normalise(store.clone(), &drv).await?;
            println!("{}", store.settings.store_dir.display_path(&nf));
        }

        Command::Realise { drv } => {
            let drv = parse_path(&store, &drv)?;
            let nf = build::realise(store.clone(), &drv).await?;
            println!("{}", store.settings.store_dir.display_path(&nf));
        }

        Command::EnsurePath { path } => {
            let path = parse_path(&store, &path)?;
            build::ensure_path(store.clone(), &path).await?;
        }

        Command::Verify { paths } => {
            let paths = if paths.is_empty() {
                store.db.query_valid_paths()?
            } else {
                paths
                    .iter()
                    .map(|p| parse_path(&store, p))
                    .collect::<anyhow::Result<_>>()?
            };
            for path in paths {
                store
                    .verify_path(&path)
                    .with_context(|| format!("verifying {path}"))?;
            }
        }

        Command::Gc { max_freed, dry_run } => {
            let results = gc::collect_garbage(
                &store,
                &GcOptions {
                    max_freed,
                    dry_run,
                    ..Default::default()
                },
            )?;
            for path in &results.deleted {
                println!("{}", store.settings.store_dir.display_path(path));
            }
            eprintln!(
                "{} paths, {} bytes {}",
                results.deleted.len(),
                results.bytes_freed,
                if dry_run { "would be freed" } else { "freed" }
            );
        }

        Command::Copy { to, path } => {
            let path = parse_path(&store, &path)?;
            let cache = open_cache(&store, &to).await?;
            cache.push_closure(&store, &path).await?;
            cache.sync().await?;
        }

        Command::Info { path } => {
            let path = parse_path(&store, &path)?;
            let info = store
                .query_path_info(&path)?
                .with_context(|| format!("{path} is not valid"))?;
            println!("Path: {}", store.settings.store_dir.display_path(&info.path));
            println!("NarHash: {}", info.nar_hash().to_prefixed_base32());
            println!("NarSize: {}", info.nar_size);
            for r in &info.references {
                println!("Reference: {r}");
            }
            if let Some(deriver) = &info.deriver {
                println!("Deriver: {deriver}");
            }
            for sig in &info.signatures {
                println!("Sig: {sig}");
            }
        }
    }

    Ok(())
}
