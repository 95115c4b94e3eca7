use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use higanbana::bridge::{ChannelHub, CsrfSource, HtmlBridgeServer, RpcHost};
use higanbana::config::Config;
use higanbana::download::{self, DownloadOptions, DownloadProgress};
use higanbana::import::{self, ImportOptions};
use higanbana::projects::{CardData, CardStore, JsonFileCardStore, MemoryCardStore, ProjectDefaults, ProjectService};
use higanbana::registry::Registry;
use higanbana::runtime::RuntimeOptions;
use higanbana::server::{self, VfsWorker};
use higanbana::store::VfsStore;
use higanbana::vfs_format::{self, ImportResult};
use higanbana::{bridge, util};

#[derive(Parser)]
#[command(name = "higanbana", about = "WebZip virtual file system and RPC bridge host")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Store directory (overrides the config file)
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    /// URL the VFS is served under (overrides the config file)
    #[arg(long, global = true)]
    extension_base: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a WebZip archive into the store
    Import {
        /// Path to the zip archive
        zip: PathBuf,
        /// Preferred homepage inside the archive
        #[arg(long)]
        home_page: Option<String>,
        /// Keep root-relative references as they are
        #[arg(long)]
        no_fix_root_relative: bool,
    },
    /// Print the project id (SHA-256) of an archive
    Hash {
        zip: PathBuf,
    },
    /// List cached projects
    List,
    /// Remove a cached project
    Evict {
        project_id: String,
    },
    /// Download a WebZip archive, optionally importing it
    Download {
        url: String,
        /// Where to save the archive
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Import the downloaded archive
        #[arg(long)]
        import: bool,
    },
    /// Serve the VFS and the host-page bridge over HTTP
    Serve {
        /// Address to listen on (overrides the config file)
        #[arg(long)]
        bind: Option<std::net::SocketAddr>,
    },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = Config::load_or_default(cli.config.as_deref())?;
    if let Some(store) = &cli.store {
        cfg.store_dir = store.clone();
    }
    if let Some(base) = &cli.extension_base {
        cfg.extension_base = base.clone();
    }
    cfg.normalize();
    Ok(cfg)
}

fn open_store(cfg: &Config) -> Result<Arc<VfsStore>> {
    Ok(Arc::new(VfsStore::open(&cfg.store_dir)?))
}

async fn read_zip(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read archive: {}", path.display()))
}

fn print_import(result: &ImportResult, cfg: &Config) {
    println!("  Project id: {}", result.project_id);
    println!("  Cache: {}", result.cache_name);
    println!("  Files: {}", result.file_count);
    println!("  HTML files: {}", result.html_files.len());
    println!("  Home page: {}", result.home_page);
    println!(
        "  URL: {}",
        vfs_format::build_vfs_url(&cfg.extension_base, &result.project_id, &result.home_page)
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let cfg = load_config(&cli)?;

    match cli.command {
        Commands::Import {
            zip,
            home_page,
            no_fix_root_relative,
        } => {
            println!("Importing WebZip...");
            println!("  Archive: {}", zip.display());
            println!("  Store: {}", cfg.store_dir.display());

            let start = Instant::now();
            let store = open_store(&cfg)?;
            let bytes = read_zip(&zip).await?;
            let options = ImportOptions {
                fix_root_relative_urls: cfg.fix_root_relative_urls && !no_fix_root_relative,
                preferred_home_page: home_page,
                inject_resizer: false,
            };
            let result = import::import_zip(&store, &cfg.extension_base, bytes, &options).await?;
            let elapsed = start.elapsed();

            println!("\nImport finished successfully!");
            print_import(&result, &cfg);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Hash { zip } => {
            let bytes = read_zip(&zip).await?;
            println!("{}", util::sha256_hex(&bytes));
        }
        Commands::List => {
            let store = open_store(&cfg)?;
            let ids = store.cached_project_ids()?;
            if ids.is_empty() {
                println!("No cached projects in {}", cfg.store_dir.display());
            }
            for id in ids {
                let files = store.open_namespace(&vfs_format::cache_name(&id))?.urls()?.len();
                println!("{id}  {files} files");
            }
        }
        Commands::Evict { project_id } => {
            let store = open_store(&cfg)?;
            let _guard = store.lock_project(&project_id).await;
            if store.clear_project_cache(&project_id)? {
                println!("Evicted {project_id}");
            } else {
                println!("Project {project_id} is not cached");
            }
        }
        Commands::Download { url, output, import } => {
            println!("Downloading WebZip...");
            println!("  URL: {url}");

            let start = Instant::now();
            let options = DownloadOptions {
                on_progress: Some(Box::new(|p: &DownloadProgress| log::info!("{}", p.render()))),
                ..DownloadOptions::default()
            };
            let downloaded = download::download_zip(&url, options).await?;
            println!("  Received: {}", download::format_bytes(downloaded.bytes.len() as f64));
            println!("  Project id: {}", util::sha256_hex(&downloaded.bytes));

            if let Some(path) = &output {
                tokio::fs::write(path, &downloaded.bytes)
                    .await
                    .with_context(|| format!("Failed to write archive: {}", path.display()))?;
                println!("  Saved to: {}", path.display());
            }
            if import {
                let store = open_store(&cfg)?;
                let options = ImportOptions {
                    fix_root_relative_urls: cfg.fix_root_relative_urls,
                    ..ImportOptions::default()
                };
                let result =
                    import::import_zip(&store, &cfg.extension_base, downloaded.bytes, &options).await?;
                println!("\nImport finished successfully!");
                print_import(&result, &cfg);
            }
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
        Commands::Serve { bind } => serve(cfg, bind).await?,
    }

    Ok(())
}

async fn serve(cfg: Config, bind: Option<std::net::SocketAddr>) -> Result<()> {
    let store = open_store(&cfg)?;
    let registry = Registry::global();
    let hub = ChannelHub::new();

    let cards: Arc<dyn CardStore> = match &cfg.cards_file {
        Some(path) => Arc::new(JsonFileCardStore::new(path)),
        None => Arc::new(MemoryCardStore::new(CardData::default())),
    };
    let projects = Arc::new(ProjectService::new(
        Arc::clone(&store),
        cards,
        cfg.extension_base.clone(),
        ProjectDefaults {
            placeholder: cfg.placeholder.clone(),
            fix_root_relative_urls: cfg.fix_root_relative_urls,
            embedded_zip_max_bytes: cfg.embedded_zip_max_bytes,
        },
    ));
    projects.install_api(&registry);

    let rpc_host = Arc::new(RpcHost::new(Arc::clone(&registry)));
    let _rpc_task = rpc_host.install(&hub);

    let origin = cfg.origin.clone();
    let (_host_window, inbox) = bridge::transport::window(
        origin.clone().unwrap_or_else(|| cfg.extension_base.clone()),
        "",
        None,
    );
    let html_bridge = Arc::new(HtmlBridgeServer::new(
        Arc::clone(&projects),
        Arc::clone(&registry),
        CsrfSource::new(HashMap::new(), origin.clone()),
    ));
    let _html_task = html_bridge.install(&hub, inbox);

    let runtime = cfg.inject_runtime.then(|| RuntimeOptions {
        origin: origin.unwrap_or_default(),
        force_base_href: false,
    });
    let worker = Arc::new(VfsWorker::new(Arc::clone(&store), &cfg.extension_base, runtime)?);
    worker.install();

    let addr = bind.unwrap_or(cfg.bind);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    println!("Serving VFS...");
    println!("  Store: {}", cfg.store_dir.display());
    println!("  Scope: {}vfs/", worker.scope_path());
    println!("  Listening on: http://{addr}");

    axum::serve(listener, server::router(worker, Some(html_bridge)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("shutting down");
        })
        .await
        .context("Server error")?;
    Ok(())
}
