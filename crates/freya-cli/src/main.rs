//! # freyafs
//!
//! Command-line entry point: parse arguments, collect the password,
//! assemble the store + core, attach to the kernel, and seal the
//! manifest back on the way out.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::warn;

use freya_cache::EvictionPolicy;
use freya_fuse::{FreyaFs, FreyaSession};
use freya_manifest::MANIFEST_FILE_NAME;
use freya_store::{BlockStore, DiskBlockStore, IpfsBlockStore};

/// Freya File System - a Mix&Slice virtual file system
#[derive(Parser)]
#[command(name = "freyafs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Mount point of FreyaFS
    #[arg(value_name = "MOUNT")]
    mountpoint: PathBuf,

    /// Folder containing your encrypted files
    #[arg(value_name = "DATA")]
    data: PathBuf,

    /// Run in debug mode
    #[arg(short, long)]
    debug: bool,

    /// Run in multi-threaded mode
    #[arg(short = 't', long)]
    multithread: bool,

    /// Maximum memory to allow for the cache of open files (in Bytes)
    #[arg(long = "cache-max-mem", value_name = "BYTES")]
    cache_max_mem: Option<u64>,

    /// How to perform cache eviction, one of: LRU
    #[arg(long = "eviction-technique", default_value = "LRU")]
    eviction_technique: EvictionPolicy,

    /// Print metadata information to the terminal
    #[arg(long = "dump-metadata")]
    dump_metadata: bool,

    /// IPFS HTTP API endpoint for remote blocks; omit to keep blocks in
    /// a local store under the data folder
    #[arg(long = "ipfs-api", value_name = "URL")]
    ipfs_api: Option<String>,
}

fn init_logging(debug: bool) {
    use tracing_subscriber::EnvFilter;

    let fallback = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Prompt for the password; a confirmation round is only asked when the
/// store is brand new (no manifest yet).
fn ask_password(confirm: bool) -> Result<String> {
    let password = rpassword::prompt_password("Password: ")?;
    if confirm {
        let again = rpassword::prompt_password("Confirm password: ")?;
        if password != again {
            bail!("your password and confirmation password do not match");
        }
    }
    Ok(password)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    std::fs::create_dir_all(&cli.data)
        .with_context(|| format!("cannot create data folder {}", cli.data.display()))?;

    let manifest_exists = cli.data.join(MANIFEST_FILE_NAME).is_file();
    let password = ask_password(!manifest_exists)?;

    let store: Arc<dyn BlockStore> = match &cli.ipfs_api {
        Some(api) => Arc::new(IpfsBlockStore::new(api.clone())),
        None => Arc::new(DiskBlockStore::new(cli.data.join("blocks"))?),
    };

    println!("[*] Mounting FreyaFS...");
    let fs = Arc::new(FreyaFs::new(
        cli.data.clone(),
        store,
        &password,
        cli.cache_max_mem.unwrap_or(u64::MAX),
        cli.eviction_technique,
    )?);

    println!("[*] FreyaFS mounted at {}", cli.mountpoint.display());
    println!(
        "FreyaFS will persist your encrypted data at {}.",
        cli.data.display()
    );
    if let Some(cap) = cli.cache_max_mem {
        println!(
            "[i] Cache memory cap set at {cap} B (eviction with {}).",
            cli.eviction_technique
        );
    }

    if cli.dump_metadata {
        println!("[i] Some information about the file system");
        print!("{}", fs.metadata_report());
    }

    if cli.multithread {
        // The core is safe under parallel dispatch; the kernel session
        // itself serializes requests.
        warn!("multi-threaded dispatch requested; requests are served from one kernel loop");
    }

    FreyaSession::new(Arc::clone(&fs)).mount(&cli.mountpoint)?;

    println!("\n[*] Unmounting FreyaFS...");
    println!("[*] FreyaFS unmounted");
    println!("[*] Updating FreyaFS metadata...");
    match fs.dump() {
        Ok(()) => println!("[*] FreyaFS metadata updated"),
        Err(e) => warn!("manifest dump failed, this mount's changes are unreachable: {e}"),
    }
    Ok(())
}
