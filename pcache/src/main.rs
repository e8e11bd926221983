use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pcache::cache::{CacheState, FileCache, FileCacheMeta};
use pcache::config::{CacheConfig, load_config};
use pcache::store::BackingFile;
use pcache::table::CacheTable;
use pcache::writeback::{LocalDirSink, WriteBackManager};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pcache")]
#[command(about = "Inspect and exercise pcache entries", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Print a committed metadata file")]
    Inspect {
        #[arg(value_name = "META_FILE")]
        meta: PathBuf,
    },
    #[command(about = "Load a cache entry and check it against its data file")]
    Verify {
        #[arg(short, long, value_name = "CONFIG_YAML")]
        config: PathBuf,
        /// Remote file handle as hex
        #[arg(value_name = "HANDLE_HEX")]
        handle: String,
    },
    #[command(about = "Load every cache entry under the configured directories")]
    Recover {
        #[arg(short, long, value_name = "CONFIG_YAML")]
        config: PathBuf,
    },
    #[command(about = "Run an insert/commit/load/flush round trip under DIR")]
    Demo {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Inspect { meta } => inspect(meta),
        Commands::Verify { config, handle } => verify(config, &handle),
        Commands::Recover { config } => recover(config),
        Commands::Demo { dir } => demo(dir),
    }
}

fn inspect(path: PathBuf) -> Result<()> {
    let meta = FileCacheMeta::read_from_file(&path)
        .with_context(|| format!("Failed to read metadata {}", path.display()))?;
    println!("handle:             {}", hex::encode(&meta.file_handle));
    println!("newly created:      {}", meta.newly_created);
    println!("remote change time: {}", meta.remote_change_time);
    println!("extents:            {}", meta.extents.len());
    for ext in &meta.extents {
        let state = CacheState::from_u8(ext.cache_state)
            .map(|s| format!("{s:?}"))
            .unwrap_or_else(|| format!("invalid({})", ext.cache_state));
        println!("  [{}, {}) {}", ext.offset, ext.offset + ext.length, state);
    }
    Ok(())
}

fn verify(config: PathBuf, handle: &str) -> Result<()> {
    let cfg = load_config(&config)?;
    let handle = hex::decode(handle).context("Handle is not valid hex")?;
    let cache = FileCache::new(&handle, &cfg.cache_dir, &cfg.meta_dir, 0, cfg.alignment);
    let size = cache.load().context("Failed to load cache entry")?;
    println!("cached bytes: {}", size);
    println!("dirty bytes:  {}", cache.dirty_data_size());

    let holes = BackingFile::new(cache.file_path()).holes()?;
    for hole in holes.iter() {
        println!("  hole [{}, {})", hole.offset, hole.end());
    }
    Ok(())
}

fn recover(config: PathBuf) -> Result<()> {
    let cfg = load_config(&config)?;
    let table = CacheTable::new(cfg);
    let loaded = table.load_all().context("Failed to scan cache directory")?;
    println!("loaded entries: {}", loaded);
    for handle in table.handles() {
        if let Some(cache) = table.get(&handle) {
            println!(
                "  {} cached {} dirty {}",
                hex::encode(&handle),
                cache.size(),
                cache.dirty_data_size()
            );
        }
    }
    Ok(())
}

fn demo(dir: PathBuf) -> Result<()> {
    let cfg = CacheConfig {
        cache_dir: dir.join("data"),
        meta_dir: dir.join("meta"),
        writeback_delay_secs: 0,
        ..CacheConfig::default()
    };
    cfg.ensure_dirs()?;
    let handle = b"pcache-demo";
    let block = 4096usize;

    let cache = FileCache::new(handle, &cfg.cache_dir, &cfg.meta_dir, 1, cfg.alignment);
    cache.create()?;
    cache.insert(0, &vec![b'c'; block], CacheState::Clean)?;
    cache.insert_dirty(block as u64, &vec![b'd'; 2 * block], cfg.writeback_delay())?;
    info!("inserted {} bytes, {} dirty", cache.size(), cache.dirty_data_size());

    let mut buf = vec![0u8; 4 * block];
    let found = cache.lookup(0, buf.len() as u64, Some(&mut buf))?;
    info!("lookup: {:?}", found);

    cache.commit(0, 0)?;
    cache.clear(true)?;

    let reloaded = FileCache::new(handle, &cfg.cache_dir, &cfg.meta_dir, 1, cfg.alignment);
    let size = reloaded.load()?;
    if size != cache.size() {
        bail!("reloaded {} bytes, expected {}", size, cache.size());
    }

    let sink = LocalDirSink::new(dir.join("remote"));
    let manager = WriteBackManager::new(sink, cfg.max_writeback_bytes, cfg.writeback_delay());
    let flushed = manager.flush(&reloaded)?;
    println!(
        "demo: OK ({} bytes cached, {} written back to {})",
        size,
        flushed,
        manager.sink().path_for(handle).display()
    );
    Ok(())
}
