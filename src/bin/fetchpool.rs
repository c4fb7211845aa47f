//! fetchpool CLI - runs a simulated scan batch or downloads from a file server.

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use fetchpool::{
    CacheCoordinator, Deadline, DiskBlobStore, Downloader, EngineConfig, Error, FetchLoader,
    HttpFetcher, Policy, Scheduler, WorkItem,
};

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";
const DEFAULT_SCAN_ITEMS: u64 = 100;

// ============================================================================
// CLI Configuration
// ============================================================================

enum Mode {
    /// Simulated workload through the scheduler.
    Scan { items: u64, work: Duration },
    /// List and download everything a server offers.
    Download { base_url: String, parts: bool },
    /// Read keys through the persistent cache.
    Cache { base_url: String, keys: Vec<String> },
}

struct CliConfig {
    mode: Mode,
    engine: EngineConfig,
}

fn print_usage() {
    eprintln!("Usage: fetchpool [OPTIONS] [KEY]...");
    eprintln!();
    eprintln!("Modes:");
    eprintln!("  (default)            Run a simulated scan batch");
    eprintln!("  --url <BASE>         Download every file the server lists");
    eprintln!("  --url <BASE> --cache Fetch KEYs through the on-disk cache");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -n, --items <N>      Simulated items (default: {DEFAULT_SCAN_ITEMS})");
    eprintln!("  -j, --batch <N>      Items in flight at once (default: from config)");
    eprintln!("      --work-ms <MS>   Simulated work per item (default: 20)");
    eprintln!("      --parts          Download each file as concurrent ranges");
    eprintln!("      --config <PATH>  Config file (default: platform config dir)");
    eprintln!("  -h, --help           Show this help");
}

fn value_of(args: &[String], i: &mut usize, flag: &str) -> String {
    *i += 1;
    args.get(*i).cloned().unwrap_or_else(|| {
        eprintln!("Error: {flag} requires a value");
        std::process::exit(1);
    })
}

fn parse_number<T: std::str::FromStr>(value: &str, flag: &str) -> T {
    value.parse().unwrap_or_else(|_| {
        eprintln!("Error: {flag} expects a number, got {value:?}");
        std::process::exit(1);
    })
}

fn parse_args() -> fetchpool::Result<CliConfig> {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut items = DEFAULT_SCAN_ITEMS;
    let mut work = Duration::from_millis(20);
    let mut batch = None;
    let mut base_url = None;
    let mut parts = false;
    let mut cache = false;
    let mut config_path = None;
    let mut keys = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "-n" | "--items" => items = parse_number(&value_of(&args, &mut i, "--items"), "--items"),
            "-j" | "--batch" => {
                batch = Some(parse_number(&value_of(&args, &mut i, "--batch"), "--batch"));
            }
            "--work-ms" => {
                work = Duration::from_millis(parse_number(
                    &value_of(&args, &mut i, "--work-ms"),
                    "--work-ms",
                ));
            }
            "--url" => base_url = Some(value_of(&args, &mut i, "--url")),
            "--parts" => parts = true,
            "--cache" => cache = true,
            "--config" => config_path = Some(PathBuf::from(value_of(&args, &mut i, "--config"))),
            arg if arg.starts_with('-') => {
                eprintln!("Error: unknown option {arg}");
                print_usage();
                std::process::exit(1);
            }
            key => keys.push(key.to_string()),
        }
        i += 1;
    }

    let config_path = config_path.unwrap_or_else(EngineConfig::default_path);
    let mut engine = EngineConfig::load_or_default(&config_path)?;
    if let Some(batch) = batch {
        engine = engine.with_batch_size(batch);
    }

    let mode = match base_url {
        None => Mode::Scan { items, work },
        Some(base_url) if cache => Mode::Cache { base_url, keys },
        Some(base_url) => Mode::Download { base_url, parts },
    };
    Ok(CliConfig { mode, engine })
}

// ============================================================================
// Progress and Summary
// ============================================================================

fn make_count_bar(len: u64, label: &str) -> ProgressBar {
    let bar = ProgressBar::new(len);
    let style = ProgressStyle::with_template(
        "{spinner:.cyan} {msg} [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, eta {eta})",
    )
    .map_or_else(|_| ProgressStyle::default_bar(), |s| s.progress_chars("━━╌"));
    bar.set_style(style);
    bar.set_message(label.to_string());
    bar
}

#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn print_summary(title: &str, succeeded: usize, failed: usize, elapsed: Duration) {
    println!("\n{SEPARATOR}");
    println!("{}", style(title).bold());
    println!("{SEPARATOR}");
    println!("  Succeeded:   {}", style(succeeded).green());
    if failed > 0 {
        println!("  Failed:      {}", style(failed).red());
    }
    println!("  Total time:  {:.1}s", elapsed.as_secs_f64());
    println!("{SEPARATOR}");
}

// ============================================================================
// Modes
// ============================================================================

/// Pretends to scan one item; every tenth item fails.
async fn scan_item(item: WorkItem<u64>, work: Duration) -> fetchpool::Result<u64> {
    let value = item.payload;
    tokio::task::spawn_blocking(move || std::thread::sleep(work))
        .await
        .map_err(|e| Error::Download(e.to_string()))?;
    if value % 10 == 9 {
        return Err(Error::Download(format!("item {value} is unreadable")));
    }
    Ok(value * value)
}

async fn run_scan(engine: &EngineConfig, items: u64, work: Duration) {
    let scheduler = Scheduler::new(Policy::SlidingWindow {
        batch_size: engine.effective_batch_size(),
    });
    let bar = make_count_bar(items, "scanning");
    bar.enable_steady_tick(Duration::from_millis(100));

    let stop = scheduler.token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, cancelling scan");
            stop.cancel();
        }
    });

    let started = Instant::now();
    let worker_bar = bar.clone();
    let work_items = (0..items).map(|n| WorkItem::new(n, n)).collect();
    let results = scheduler
        .run(work_items, move |item, _token| {
            let bar = worker_bar.clone();
            async move {
                let result = scan_item(item, work).await;
                bar.inc(1);
                result
            }
        })
        .await;
    bar.finish_and_clear();

    let stats = scheduler.stats();
    let failed = results.iter().filter(|r| r.result.is_err()).count();
    print_summary(
        "Scan Summary",
        results.len() - failed,
        failed,
        started.elapsed(),
    );
    println!(
        "  Peak in flight: {} (ceiling {})",
        stats.peak_in_flight,
        engine.effective_batch_size()
    );
    println!("  Throughput:     {:.1} items/s", stats.count_per_second);
}

async fn run_download(engine: EngineConfig, base_url: &str, parts: bool) -> fetchpool::Result<()> {
    let downloader = Arc::new(Downloader::new(HttpFetcher::with_defaults(base_url)?, engine));
    let status = downloader.status().await?;
    println!("Server: {}", style(status.trim()).cyan());

    let files = downloader.available_files().await?;
    let total: usize = files.iter().map(|f| f.size).sum();
    println!("{} file(s), {}", files.len(), format_bytes(total as u64));

    let stop_handle = Arc::clone(&downloader);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop_handle.stop();
        }
    });

    let started = Instant::now();
    let bar = make_count_bar(files.len() as u64, "downloading");
    let (succeeded, failed) = if parts {
        let (mut ok, mut failed) = (0, 0);
        for file in &files {
            match downloader.multi_download_with_progress(file).await {
                Ok(_) => ok += 1,
                Err(e) => {
                    log::error!("{}: {e}", file.name);
                    failed += 1;
                }
            }
            bar.inc(1);
        }
        (ok, failed)
    } else {
        let results = downloader.download_all(files.clone()).await;
        bar.inc(results.len() as u64);
        let failed = results.iter().filter(|r| r.result.is_err()).count();
        for result in &results {
            if let Err(e) = &result.result {
                let name = usize::try_from(result.id)
                    .ok()
                    .and_then(|i| files.get(i))
                    .map_or("?", |f| f.name.as_str());
                log::error!("{name}: {e}");
            }
        }
        (results.len() - failed, failed)
    };
    bar.finish_and_clear();
    print_summary("Download Summary", succeeded, failed, started.elapsed());
    Ok(())
}

async fn run_cache(engine: &EngineConfig, base_url: &str, keys: &[String]) -> fetchpool::Result<()> {
    let store = DiskBlobStore::open(engine.resolved_cache_dir()).await?;
    log::info!("Cache directory: {}", store.root().display());
    let loader = FetchLoader::new(Arc::new(HttpFetcher::with_defaults(base_url)?))
        .with_deadline(Deadline::from_duration(engine.timeout()));
    let cache = CacheCoordinator::open_with_loader(Arc::new(store), Arc::new(loader)).await?;

    let started = Instant::now();
    let lookups = keys.iter().map(|key| {
        let cache = cache.clone();
        async move { (key, cache.get(key).await) }
    });
    let mut failed = 0;
    for (key, result) in futures::future::join_all(lookups).await {
        match result {
            Ok(data) => println!("  {key}: {}", format_bytes(data.len() as u64)),
            Err(e) => {
                println!("  {key}: {}", style(e).red());
                failed += 1;
            }
        }
    }
    print_summary("Cache Summary", keys.len() - failed, failed, started.elapsed());
    let stats = cache.stats();
    println!(
        "  Memory hits: {}  Disk hits: {}  Fetches: {}  Joined: {}",
        stats.memory_hits, stats.disk_hits, stats.fetches, stats.joined
    );
    Ok(())
}

#[tokio::main]
async fn main() -> fetchpool::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let CliConfig { mode, engine } = parse_args()?;
    log::debug!("Engine config: {engine:?}");

    match mode {
        Mode::Scan { items, work } => {
            run_scan(&engine, items, work).await;
            Ok(())
        }
        Mode::Download { base_url, parts } => run_download(engine, &base_url, parts).await,
        Mode::Cache { base_url, keys } => {
            if keys.is_empty() {
                eprintln!("Error: --cache needs at least one KEY");
                std::process::exit(1);
            }
            run_cache(&engine, &base_url, &keys).await
        }
    }
}
