mod backend;
mod cache;
mod config;
mod logging;
mod network;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use serde::Serialize;
use std::path::PathBuf;

use crate::backend::{BackendClient, CachedBackend, CompanyStatus};
use crate::cache::{CacheLayer, CacheResult, ConfiguredStorage};
use crate::config::{Config, StorageKind};
use crate::network::{HttpProbe, StaticProbe};

#[derive(Parser, Debug)]
#[command(name = "hrcache")]
#[command(about = "Cached, offline-tolerant reads against the HR backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/hrcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Override the configured cache storage
  #[arg(long, value_enum)]
  storage: Option<StorageKind>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  #[command(flatten)]
  Backend(BackendCommand),
  /// Remove a cache key, or every key with a prefix (`companies_*`)
  Clear { pattern: String },
  /// List cached entries
  Entries,
  /// Check whether the backend is reachable
  Probe,
}

/// Commands that talk to the backend.
#[derive(Subcommand, Debug)]
enum BackendCommand {
  /// Show one company
  Company {
    id: String,
    /// Bypass fresh cache entries
    #[arg(short, long)]
    refresh: bool,
  },
  /// List companies
  Companies {
    #[arg(long, value_enum)]
    status: Option<CompanyStatus>,
    #[arg(short, long)]
    refresh: bool,
  },
  /// List a company's employees
  Employees {
    company_id: String,
    #[arg(short, long)]
    refresh: bool,
  },
  /// Show one employee
  Employee {
    id: String,
    #[arg(short, long)]
    refresh: bool,
  },
  /// Activate or deactivate a company
  SetStatus {
    company_id: String,
    #[arg(value_enum)]
    status: CompanyStatus,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(storage) = args.storage {
    config.cache.storage = storage;
  }

  let _log_guard = logging::init_logging(&config.log)?;

  // Clearing and listing never touch the network
  let needs_network = !matches!(args.command, Command::Clear { .. } | Command::Entries);
  let cache = build_cache(&config, needs_network)?;

  match args.command {
    Command::Clear { pattern } => {
      let removed = cache.clear_cache(&pattern)?;
      println!("removed {} entries", removed);
    }
    Command::Entries => {
      for status in cache.entries()? {
        let entry = &status.entry;
        println!(
          "{}\tstored {}\tttl {}ms\t{}{}",
          entry.key,
          entry.stored_at.to_rfc3339(),
          entry.ttl.num_milliseconds(),
          if status.expired { "expired" } else { "fresh" },
          if entry.critical { "\tcritical" } else { "" },
        );
      }
    }
    Command::Probe => {
      let available = cache.is_network_available().await;
      println!("{}", if available { "online" } else { "offline" });
    }
    Command::Backend(command) => {
      let client = BackendClient::new(&config)?;
      let backend = CachedBackend::new(client, cache, config.cache.default_ttl());
      run_backend_command(&backend, command).await?;
    }
  }

  Ok(())
}

fn build_cache(config: &Config, needs_network: bool) -> Result<CacheLayer<ConfiguredStorage>> {
  let storage = ConfiguredStorage::from_config(&config.cache)?;
  let cache = CacheLayer::new(storage)
    .with_stale_policy(config.cache.stale_fallback)
    .with_probe_failure(config.network.on_probe_error);

  if needs_network && config.network.probe {
    let probe = HttpProbe::new(config.probe_url()?, config.network.probe_timeout())?;
    Ok(cache.with_probe(probe))
  } else {
    Ok(cache.with_probe(StaticProbe(true)))
  }
}

async fn run_backend_command(backend: &CachedBackend, command: BackendCommand) -> Result<()> {
  match command {
    BackendCommand::Company { id, refresh } => {
      print_result(backend.company(&id, refresh).await?)?
    }
    BackendCommand::Companies { status, refresh } => {
      print_result(backend.companies(status, refresh).await?)?
    }
    BackendCommand::Employees {
      company_id,
      refresh,
    } => print_result(backend.employees(&company_id, refresh).await?)?,
    BackendCommand::Employee { id, refresh } => {
      print_result(backend.employee(&id, refresh).await?)?
    }
    BackendCommand::SetStatus { company_id, status } => {
      backend.set_company_status(&company_id, status).await?;
      println!("company {} is now {}", company_id, status.as_str());
    }
  }

  Ok(())
}

/// Print data as JSON on stdout; cache provenance goes to stderr.
fn print_result<T: Serialize>(result: CacheResult<T>) -> Result<()> {
  if let Some(error) = &result.error {
    eprintln!(
      "warning: viewing cached data from {} ({}): {}",
      result
        .cached_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "unknown time".to_string()),
      result.source,
      error
    );
  } else if result.is_from_cache() {
    tracing::info!(source = %result.source, "served from cache");
  }

  println!("{}", serde_json::to_string_pretty(&result.data)?);
  Ok(())
}
