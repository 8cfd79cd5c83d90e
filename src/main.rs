use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

use refetch::cache::{CacheLedger, Params, SqliteLedgerStore};
use refetch::config::Config;
use refetch::repository::SqliteRepository;
use refetch::sync::{BearerAuth, DefaultHooks, Delivery, Engine, FetchMode, SyncHooks};
use refetch::transport::{HttpTransport, Method};

#[derive(Parser, Debug)]
#[command(name = "refetch")]
#[command(about = "Fetch, map and cache remote JSON resources")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/refetch/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch a collection
  Many {
    key: String,
    /// Request parameter, repeatable
    #[arg(short, long = "param", value_name = "K=V", value_parser = parse_param)]
    params: Vec<(String, String)>,
    /// Add to the cached identities instead of replacing them
    #[arg(long)]
    append: bool,
  },
  /// Fetch a single object by identity
  One {
    key: String,
    id: String,
    #[arg(short, long = "param", value_name = "K=V", value_parser = parse_param)]
    params: Vec<(String, String)>,
  },
  /// Forget cached requests for one key, or for every key
  Clear { key: Option<String> },
  /// Report whether a collection request would go to the server
  Stale {
    key: String,
    #[arg(short, long = "param", value_name = "K=V", value_parser = parse_param)]
    params: Vec<(String, String)>,
  },
  /// Send a request outside the cache and print the decoded body
  Request {
    #[arg(value_parser = parse_method)]
    method: Method,
    /// Path relative to base_url
    endpoint: String,
    #[arg(short, long = "param", value_name = "K=V", value_parser = parse_param)]
    params: Vec<(String, String)>,
  },
  /// List the configured resource keys
  Keys,
}

fn parse_param(pair: &str) -> Result<(String, String), String> {
  Params::parse_pair(pair).ok_or_else(|| format!("expected key=value, got {}", pair))
}

fn parse_method(method: &str) -> Result<Method, String> {
  Method::parse(method).ok_or_else(|| format!("unsupported method {}", method))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let data_dir = config.data_dir()?;
  std::fs::create_dir_all(&data_dir)
    .map_err(|e| eyre!("Failed to create data directory {}: {}", data_dir.display(), e))?;
  let _log_guard = init_tracing(&data_dir);

  let engine = build_engine(&config, &data_dir)?;

  match args.command {
    Command::Many { key, params, append } => {
      let mode = if append {
        FetchMode::Append
      } else {
        FetchMode::Replace
      };
      let subscription = engine.fetch_many(&key, params.into_iter().collect(), mode)?;
      print_deliveries(subscription).await?;
    }
    Command::One { key, id, params } => {
      let subscription = engine.fetch_one(&key, id, params.into_iter().collect())?;
      print_deliveries(subscription).await?;
    }
    Command::Clear { key: Some(key) } => {
      engine.clear_cache_for_key(&key).await?;
      info!(key = %key, "Cleared cache");
    }
    Command::Clear { key: None } => {
      engine.clear_cache().await?;
      info!("Cleared cache");
    }
    Command::Stale { key, params } => {
      let stale = engine.is_stale(&key, &params.into_iter().collect())?;
      println!("{}", json!({ "key": key, "stale": stale }));
    }
    Command::Request { method, endpoint, params } => {
      let body = engine.request(method, &endpoint, params.into_iter().collect()).await?;
      println!("{}", body);
    }
    Command::Keys => {
      let mut keys: Vec<_> = engine.registry().keys().collect();
      keys.sort_unstable();
      for key in keys {
        println!("{}", key);
      }
    }
  }

  Ok(())
}

/// Log to a daily file in the data directory; stdout carries JSON only.
fn init_tracing(data_dir: &Path) -> WorkerGuard {
  use tracing_subscriber::prelude::*;
  use tracing_subscriber::EnvFilter;

  let appender = tracing_appender::rolling::daily(data_dir, "refetch.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_env("REFETCH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true),
    )
    .init();

  guard
}

fn build_engine(config: &Config, data_dir: &Path) -> Result<Engine> {
  let registry = Arc::new(config.registry()?);
  let repository = Arc::new(SqliteRepository::open(&data_dir.join("objects.db"))?);
  let store = Arc::new(SqliteLedgerStore::open(&data_dir.join("ledger.db"))?);
  let ledger = CacheLedger::load(store)?;
  let transport = Arc::new(HttpTransport::new()?);

  let hooks: Arc<dyn SyncHooks> = match config.api_token() {
    Some(token) => Arc::new(BearerAuth::new(token)),
    None => Arc::new(DefaultHooks),
  };

  info!(base_url = %config.base_url, data_dir = %data_dir.display(), "Starting engine");

  Ok(
    Engine::builder(config.base_url.clone(), registry, repository, transport)
      .hooks(hooks)
      .ledger(ledger)
      .build(),
  )
}

async fn print_deliveries(mut subscription: refetch::Subscription) -> Result<()> {
  while let Some(delivery) = subscription.next().await {
    let (phase, snapshot) = match delivery {
      Delivery::Stale(snapshot) => ("stale", snapshot),
      Delivery::Fresh(snapshot) => ("fresh", snapshot),
      Delivery::Failed(err) => return Err(err.into()),
    };

    let objects: Vec<_> = snapshot.objects.iter().map(|o| o.to_json()).collect();
    println!(
      "{}",
      json!({
        "phase": phase,
        "objects": objects,
        "has_more": snapshot.has_more,
      })
    );
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_request_command_parses_method() {
    let args = Args::try_parse_from(["refetch", "request", "post", "/posts", "-p", "title=hi"]).unwrap();
    match args.command {
      Command::Request { method, endpoint, params } => {
        assert_eq!(method, Method::Post);
        assert_eq!(endpoint, "/posts");
        assert_eq!(params, vec![("title".to_string(), "hi".to_string())]);
      }
      other => panic!("unexpected command {:?}", other),
    }
  }

  #[test]
  fn test_request_command_rejects_unknown_method() {
    assert!(Args::try_parse_from(["refetch", "request", "TRACE", "/posts"]).is_err());
  }

  #[test]
  fn test_keys_command() {
    let args = Args::try_parse_from(["refetch", "-c", "api.yaml", "keys"]).unwrap();
    assert!(matches!(args.command, Command::Keys));
    assert_eq!(args.config, Some(PathBuf::from("api.yaml")));
  }
}
