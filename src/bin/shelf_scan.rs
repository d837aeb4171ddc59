//! shelf_scan - supervised shelf scanning service
//!
//! Subcommands:
//! - `service`: run the supervised loop until Ctrl-C
//! - `setup`: one cycle now (shelf setup), prints the detection result
//! - `status`: summary of the committed active state
//! - `check-catalog`: validate a catalog file or directory
//! - `export`: write the committed before/after images and result to a directory

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

use shelf_watch::state::{export_record, ActiveStateReader, SqliteActiveStateReader};
use shelf_watch::ui::Ui;
use shelf_watch::{Catalog, ServiceState, ShelfConfig, ShelfService};

#[derive(Parser, Debug)]
#[command(name = "shelf_scan", version, about = "Supervised shelf scanning service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the supervised scan loop until Ctrl-C
    Service {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Run a single scan cycle now and commit it
    Setup {
        #[command(flatten)]
        common: CommonArgs,
        /// Progress output: auto, plain, pretty
        #[arg(long, default_value = "auto")]
        ui: String,
    },

    /// Print the committed active state as JSON
    Status {
        #[command(flatten)]
        common: CommonArgs,
        /// Also include this many history entries
        #[arg(long, default_value_t = 0)]
        history: usize,
    },

    /// Validate a catalog file or directory
    CheckCatalog {
        /// Catalog path (defaults to the configured one)
        path: Option<PathBuf>,
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Write before/after images and result JSON of the current commit
    Export {
        #[command(flatten)]
        common: CommonArgs,
        #[arg(long, default_value = "shelf_export")]
        out: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
struct CommonArgs {
    /// Config file (JSON, or TOML with a .toml extension)
    #[arg(long, env = "SHELF_CONFIG")]
    config: Option<PathBuf>,
    /// Frame source URI (stub://name, watch://path, or an image path)
    #[arg(long)]
    source: Option<String>,
    /// Catalog file or directory
    #[arg(long)]
    catalog: Option<PathBuf>,
    /// Active state database
    #[arg(long)]
    db: Option<String>,
    /// Detector backend name
    #[arg(long)]
    backend: Option<String>,
    /// Target cycle period in milliseconds
    #[arg(long)]
    cycle_ms: Option<u64>,
    /// Directory for the latest before/after images
    #[arg(long)]
    visual_dir: Option<PathBuf>,
}

impl CommonArgs {
    fn load_config(&self) -> Result<ShelfConfig> {
        let mut cfg = match &self.config {
            Some(path) => ShelfConfig::load_from(path)?,
            None => ShelfConfig::load()?,
        };
        if let Some(source) = &self.source {
            cfg.source.uri = source.clone();
        }
        if let Some(catalog) = &self.catalog {
            cfg.catalog_path = catalog.clone();
        }
        if let Some(db) = &self.db {
            cfg.store.db_path = db.clone();
        }
        if let Some(backend) = &self.backend {
            cfg.detection.backend = backend.clone();
        }
        if let Some(cycle_ms) = self.cycle_ms {
            cfg.supervisor.cycle_period = Duration::from_millis(cycle_ms);
        }
        if let Some(dir) = &self.visual_dir {
            cfg.store.visual_dir = Some(dir.clone());
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Service { common } => run_service(&common.load_config()?),
        Command::Setup { common, ui } => run_setup(&common.load_config()?, &ui),
        Command::Status { common, history } => print_status(&common.load_config()?, history),
        Command::CheckCatalog { path, common } => {
            let path = match path {
                Some(path) => path,
                None => common.load_config()?.catalog_path,
            };
            check_catalog(&path)
        }
        Command::Export { common, out } => export(&common.load_config()?, &out),
    }
}

fn run_service(cfg: &ShelfConfig) -> Result<()> {
    let mut service = ShelfService::from_config(cfg)?;

    let (tx, rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })
    .context("error setting Ctrl-C handler")?;

    service.start()?;
    log::info!(
        "shelf_scan running. source={} catalog={} db={}",
        cfg.source.uri,
        cfg.catalog_path.display(),
        cfg.store.db_path
    );
    log::info!("waiting for shutdown signal (Ctrl-C)...");

    loop {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(()) => {
                log::info!("shutdown signal received, stopping scan loop...");
                break;
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if service.status().state == ServiceState::Failed {
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = service.status();
    if status.state == ServiceState::Failed {
        let reason = status.last_error.unwrap_or_else(|| "unknown".to_string());
        service.stop(None)?;
        return Err(anyhow!("shelf service failed: {}", reason));
    }
    service.stop(None)?;
    log::info!("shelf_scan stopped");
    Ok(())
}

fn run_setup(cfg: &ShelfConfig, ui_flag: &str) -> Result<()> {
    let ui = Ui::from_flag(Some(ui_flag));

    {
        let mut stage = ui.stage("Validate catalog");
        if let Err(e) = Catalog::load(&cfg.catalog_path) {
            stage.fail(e.to_string());
            return Err(e.into());
        }
    }

    let mut service = {
        let _stage = ui.stage("Prepare pipeline");
        ShelfService::from_config(cfg)?
    };

    let result = {
        let mut stage = ui.stage("Scan shelf");
        match service.run_once() {
            Ok(result) => result,
            Err(e) => {
                stage.fail(e.to_string());
                return Err(e.into());
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.is_complete() {
        log::warn!("missing products: {}", result.missing.join(", "));
    }
    Ok(())
}

fn open_reader(db_path: &str) -> Result<SqliteActiveStateReader> {
    if !Path::new(db_path).exists() {
        return Err(anyhow!("no active state database at {}", db_path));
    }
    SqliteActiveStateReader::open(db_path)
        .with_context(|| format!("failed to open active state {}", db_path))
}

fn print_status(cfg: &ShelfConfig, history: usize) -> Result<()> {
    let reader = open_reader(&cfg.store.db_path)?;
    let record = reader.read()?;
    let history = if history > 0 {
        reader.history(history)?
    } else {
        Vec::new()
    };
    let out = serde_json::json!({
        "db_path": cfg.store.db_path,
        "active_state": record,
        "history": history,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn check_catalog(path: &Path) -> Result<()> {
    let catalog = Catalog::load(path)?;
    println!("catalog ok: {} entries in {}", catalog.len(), path.display());
    for entry in catalog.entries() {
        println!(
            "  {:<24} {:?} {}",
            entry.product_id,
            entry.bounding_box.as_array(),
            entry.display_name
        );
    }
    Ok(())
}

fn export(cfg: &ShelfConfig, out: &Path) -> Result<()> {
    let reader = open_reader(&cfg.store.db_path)?;
    let record = reader
        .read()?
        .ok_or_else(|| anyhow!("nothing committed yet in {}", cfg.store.db_path))?;
    export_record(&record, out)?;
    println!(
        "exported generation {} ({}) to {}",
        record.generation,
        record.run_id,
        out.display()
    );
    Ok(())
}
