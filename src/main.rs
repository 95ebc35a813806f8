use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use marketsync::app::App;
use marketsync::cache::CacheResult;
use marketsync::config::Config;
use marketsync::logging;
use marketsync::market::{ListingImage, NewListing};
use marketsync::queue::PendingOperation;

/// How long a one-shot command waits for background refreshes before exiting
const SETTLE_LIMIT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "marketsync")]
#[command(about = "Offline-first marketplace client data layer")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/marketsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Write logs to a daily rolling file in this directory instead of stderr
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show listings, cache-first
  Listings {
    /// Wait for the network instead of answering from the cache
    #[arg(short, long)]
    refresh: bool,
  },
  /// Show categories, cache-first
  Categories,
  /// Show a user profile, cache-first
  Profile { user_id: String },
  /// Queue a new listing for upload
  Create {
    #[arg(long)]
    title: String,
    /// Price in minor currency units
    #[arg(long)]
    price: u64,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    category: Option<String>,
    /// Image file to attach (repeatable)
    #[arg(long = "image")]
    images: Vec<PathBuf>,
  },
  /// List queued operations
  Pending,
  /// Make a failed operation eligible for submission again
  Retry { id: String },
  /// Drop a queued operation
  Remove { id: String },
  /// Drain the queue now
  Sync,
  /// Show connectivity and queue state
  Status,
  /// Run the sync driver until interrupted
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.log_dir.as_deref())?;

  let config = Config::load(args.config.as_deref())?;
  let mut app = App::new(config).await?;

  match args.command {
    Command::Listings { refresh } => {
      let result = app.market.listings(refresh).await?;
      print_result(result, |listings| {
        for listing in listings {
          println!("{}\t{}\t{}", listing.id, listing.price, listing.title);
        }
      });
      app.market.settle(SETTLE_LIMIT).await;
    }
    Command::Categories => {
      let result = app.market.categories().await?;
      print_result(result, |categories| {
        for category in categories {
          println!("{}\t{}", category.id, category.name);
        }
      });
      app.market.settle(SETTLE_LIMIT).await;
    }
    Command::Profile { user_id } => {
      let result = app.market.profile(&user_id).await?;
      print_result(result, |profile| {
        println!("{}\t{}", profile.id, profile.display_name);
        if let Some(rating) = profile.rating {
          println!("rating\t{:.1}", rating);
        }
      });
      app.market.settle(SETTLE_LIMIT).await;
    }
    Command::Create {
      title,
      price,
      description,
      category,
      images,
    } => {
      let images = images
        .iter()
        .map(|path| read_image(path))
        .collect::<Result<Vec<_>>>()?;
      let id = app
        .market
        .create_listing(NewListing {
          title,
          price,
          description,
          category_id: category,
          images,
        })
        .await?;
      println!("queued {}", id);

      if app.connectivity.is_online() {
        let report = app.sync.drain_now().await;
        println!("{:?}", report);
      }
    }
    Command::Pending => {
      for operation in app.queue.list_pending().await? {
        print_operation(&operation);
      }
    }
    Command::Retry { id } => {
      if !app.queue.retry(&id).await? {
        return Err(eyre!("Operation {} is not in the failed state", id));
      }
      println!("{} will be retried", id);
    }
    Command::Remove { id } => {
      if !app.queue.remove(&id).await? {
        return Err(eyre!("Operation {} not found", id));
      }
      println!("removed {}", id);
    }
    Command::Sync => {
      app.connectivity.refresh().await;
      let report = app.sync.drain_now().await;
      println!("{:?}", report);
    }
    Command::Status => {
      println!("connectivity\t{:?}", app.connectivity.state());
      println!("pending\t{}", app.queue.pending_count().await?);
      println!("sync\t{:?}", app.sync.state());
    }
    Command::Watch => {
      let _connectivity = app.connectivity.subscribe(|state| {
        println!("connectivity\t{:?}", state);
      });
      let _queue = app.queue.subscribe(|event| {
        println!("queue\t{:?}", event);
      });
      let mut sync_states = app.sync.watch_state();
      let sync_printer = tokio::spawn(async move {
        while sync_states.changed().await.is_ok() {
          println!("sync\t{:?}", *sync_states.borrow_and_update());
        }
      });

      app.start_background();
      tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for ctrl-c: {}", e))?;
      app.shutdown().await;
      sync_printer.abort();
    }
  }

  Ok(())
}

fn print_result<T>(result: Option<CacheResult<T>>, print: impl FnOnce(&T)) {
  match result {
    Some(result) => {
      if let Some(at) = result.cached_at {
        println!("# {:?}, cached at {}", result.source, at);
      }
      print(&result.data);
    }
    None => println!("# offline and nothing cached"),
  }
}

fn print_operation(operation: &PendingOperation) {
  println!(
    "{}\t{}\tattempts={}\t{}",
    operation.id,
    operation.status,
    operation.attempt_count,
    operation.last_error.as_deref().unwrap_or("")
  );
}

fn read_image(path: &Path) -> Result<ListingImage> {
  let data =
    std::fs::read(path).map_err(|e| eyre!("Failed to read image {}: {}", path.display(), e))?;
  let file_name = path
    .file_name()
    .map(|name| name.to_string_lossy().into_owned())
    .unwrap_or_else(|| "image".to_string());
  Ok(ListingImage::from_bytes(file_name, data))
}
