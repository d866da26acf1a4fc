use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Method;
use tracing::{info, warn};
use url::Url;

use offgrid::cache::Served;
use offgrid::control::ControlMessage;
use offgrid::logging::init_logging;
use offgrid::sync::DrainReport;
use offgrid::{Config, Destination, Engine, Interception, Request};

#[derive(Parser, Debug)]
#[command(name = "offgrid")]
#[command(about = "Offline request interception and caching engine")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offgrid/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Intercept a request and print the response
  Fetch {
    /// Absolute URL or a path on the origin
    url: String,
    #[arg(short, long, default_value = "GET")]
    method: Method,
    /// Accept header to send
    #[arg(long)]
    accept: Option<String>,
    /// Declared resource type (document, script, style, image, font, fetch, other)
    #[arg(short, long)]
    destination: Option<Destination>,
  },
  /// Send a mutation, queueing it if the origin is unreachable
  Send {
    method: Method,
    url: String,
    #[arg(short, long)]
    body: Option<String>,
    #[arg(long, default_value = "application/json")]
    content_type: String,
  },
  /// Install the configured generation and activate it
  Install,
  /// Send a control message (ACTIVATE_NOW, REPORT_VERSION, PURGE_ALL)
  Control { message: ControlMessage },
  /// Deliver queued mutations now
  Drain,
  /// List queued mutations
  Queue,
  /// Remove expired dynamic cache entries
  Sweep,
  /// Keep the engine running: sweeper, connectivity probe and replay
  Run,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_logging(config.log_file.as_deref());

  let engine = Engine::open(config)?;
  engine.resume()?;

  match args.command {
    Command::Fetch {
      url,
      method,
      accept,
      destination,
    } => {
      let url = resolve(&engine, &url)?;
      let mut request = Request::new(method, url.clone());
      if let Some(accept) = accept {
        request = request.with_header(ACCEPT, HeaderValue::from_str(&accept)?);
      }
      let destination = destination.unwrap_or_else(|| Destination::from_path(url.path()));
      request = request.with_destination(destination);
      print_interception(engine.handle(request).await?)?;
    }
    Command::Send {
      method,
      url,
      body,
      content_type,
    } => {
      let mut request = Request::new(method, resolve(&engine, &url)?)
        .with_header(CONTENT_TYPE, HeaderValue::from_str(&content_type)?);
      if let Some(body) = body {
        request = request.with_body(body);
      }
      print_interception(engine.handle(request).await?)?;
    }
    Command::Install => {
      let activation = engine.deploy().await?;
      println!(
        "active: {} (previous: {}, purged {} caches)",
        activation.generation,
        activation.previous.as_deref().unwrap_or("none"),
        activation.purged
      );
      for (cache, entries) in engine.caches()? {
        println!("  {:<32} {:>6} entries", cache.name, entries);
      }
    }
    Command::Control { message } => {
      let reply = engine.control(message)?;
      println!("{}", serde_json::to_string(&reply)?);
    }
    Command::Drain => {
      let mut rejections = engine.subscribe_rejections();
      let report = engine.drain().await?;
      while let Ok(rejected) = rejections.try_recv() {
        println!("rejected #{}: {}", rejected.mutation.id, rejected.error);
      }
      match report {
        DrainReport::AlreadyRunning => println!("a drain is already running"),
        DrainReport::Drained {
          delivered,
          rejected,
        } => println!("queue empty: {} delivered, {} rejected", delivered, rejected),
        DrainReport::Halted {
          delivered,
          rejected,
          remaining,
          retry_after,
        } => println!(
          "halted: {} delivered, {} rejected, {} remaining, retry in {:?}",
          delivered, rejected, remaining, retry_after
        ),
      }
    }
    Command::Queue => {
      let pending = engine.pending()?;
      if pending.is_empty() {
        println!("queue is empty");
      }
      for mutation in pending {
        println!(
          "#{:<5} {:<6} {} ({} bytes, {} attempts, queued {})",
          mutation.id,
          mutation.method,
          mutation.url,
          mutation.body_len(),
          mutation.attempts,
          mutation.enqueued_at.format("%Y-%m-%d %H:%M:%S")
        );
      }
    }
    Command::Sweep => {
      println!("removed {} expired entries", engine.sweep().await);
    }
    Command::Run => {
      if let Err(e) = engine.deploy().await {
        warn!(error = %e, "deploy failed, serving the previous generation");
      }

      let mut rejections = engine.subscribe_rejections();
      let tasks = engine.spawn_background();
      info!("running, press Ctrl-C to stop");
      loop {
        tokio::select! {
          signal = tokio::signal::ctrl_c() => {
            signal?;
            break;
          }
          Some(rejected) = rejections.recv() => {
            warn!(
              id = rejected.mutation.id,
              url = %rejected.mutation.url,
              error = %rejected.error,
              "mutation rejected"
            );
          }
        }
      }

      info!("shutting down");
      for task in tasks {
        task.abort();
      }
    }
  }

  Ok(())
}

fn resolve(engine: &Engine, target: &str) -> Result<Url> {
  match Url::parse(target) {
    Ok(url) => Ok(url),
    Err(url::ParseError::RelativeUrlWithoutBase) => engine
      .config()
      .origin_url()?
      .join(target)
      .map_err(|e| eyre!("Invalid path '{}': {}", target, e)),
    Err(e) => Err(eyre!("Invalid URL '{}': {}", target, e)),
  }
}

fn print_interception(interception: Interception) -> Result<()> {
  let Interception::Respond(Served {
    response,
    source,
    stored_at,
  }) = interception
  else {
    println!("pass-through: the request is not intercepted");
    return Ok(());
  };

  match stored_at {
    Some(stored_at) => eprintln!("{} ({}, stored {})", response.status, source, stored_at),
    None => eprintln!("{} ({})", response.status, source),
  }
  for (name, value) in response.header_pairs() {
    eprintln!("{}: {}", name, value);
  }
  std::io::stdout().write_all(&response.body)?;
  Ok(())
}
