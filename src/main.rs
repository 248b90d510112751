use clap::{Parser, Subcommand};
use recitale::cache::{self, CacheSession, CacheStore};
use recitale::ffmpeg::{self, SystemRunner};
use recitale::imaging::RustBackend;
use recitale::pipeline::{self, CancelFlag, Pipeline};
use recitale::registry::Registries;
use recitale::{config, discover, output};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(clap::Args, Clone)]
struct BuildArgs {
    /// Number of parallel image workers (default: all cores)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Ignore the existing cache and render everything
    #[arg(long)]
    no_cache: bool,
}

#[derive(Parser)]
#[command(name = "recitale")]
#[command(about = "Incremental media builds for gallery sites")]
#[command(long_about = "\
Incremental media builds for gallery sites

Every directory under the content root that holds media is a gallery.
Images get resized thumbnails, videos get frame thumbnails and a web
re-encode, audio gets a re-encode. A derived file is only rendered again
when its source or its options changed, or when it went missing.

  content/
  ├── recitale.toml           # Optional config, see 'recitale gen-config'
  ├── landscapes/
  │   ├── dawn.jpg            # → build/landscapes/dawn-<sum>-x900.jpg, dawn-<sum>-1200x.jpg
  │   └── timelapse.mp4       # → build/landscapes/timelapse-<sum>-1280x720.webm
  └── field-notes/
      └── birds.flac          # → build/field-notes/birds-<sum>.mp3

Video and audio need ffmpeg (or avconv) on PATH; without it they are skipped.")]
#[command(version)]
struct Cli {
    /// Content directory
    #[arg(long, default_value = ".", global = true)]
    source: PathBuf,

    /// Output directory
    #[arg(long, default_value = "build", global = true)]
    output: PathBuf,

    /// Log level filter (RUST_LOG takes precedence)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Render every stale thumbnail and re-encode
    Build(BuildArgs),
    /// List assets and whether their derived files are up to date
    Check,
    /// Print a stock recitale.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match &cli.command {
        Command::Build(args) => build(&cli, args)?,
        Command::Check => check(&cli)?,
        Command::GenConfig => print!("{}", config::stock_config_toml()),
    }
    Ok(())
}

/// Logs go to stderr so stdout stays the build report.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn build(cli: &Cli, args: &BuildArgs) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    ctrlc::set_handler(move || handler_flag.cancel())?;

    let mut site_config = config::load_config(&cli.source)?;
    let encoders = ffmpeg::detect_encoders(&mut site_config, ffmpeg::lookup_on_path);
    let mut registries = Registries::new(&cli.source, &cli.output, &site_config);
    let found = discover::discover(&cli.source, &cli.output, &mut registries, &site_config.variants)?;
    println!("{}", output::format_discover_summary(&found));

    let cache_file = cache::cache_path(&cli.output);
    let mut session = if args.no_cache {
        CacheSession::fresh(cache_file)
    } else {
        CacheSession::open(cache_file)?
    };

    let threads = config::effective_threads(&site_config.processing, args.jobs);
    info!(threads, "starting build");
    let backend = RustBackend::new();
    let result = Pipeline::new(threads, &backend, &SystemRunner)
        .with_encoders(encoders)
        .with_encode_buffer(site_config.image.encode_buffer)
        .with_cancel(cancel)
        .with_progress(true)
        .run(&registries, session.store_mut());

    // Flush whatever was merged, interrupted or not
    let summary = pipeline::close_session(session, result)?;
    output::print_build_output(&summary, &cli.source);

    let failed = summary.failure_count();
    if failed > 0 {
        return Err(format!("{failed} asset(s) failed, see log above").into());
    }
    Ok(())
}

fn check(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let site_config = config::load_config(&cli.source)?;
    let mut registries = Registries::new(&cli.source, &cli.output, &site_config);
    let found = discover::discover(&cli.source, &cli.output, &mut registries, &site_config.variants)?;
    println!("{}", output::format_discover_summary(&found));

    let store = CacheStore::load(&cache::cache_path(&cli.output))?;
    let backend = RustBackend::new();
    let mut stale = 0;
    for registry in [&registries.images, &registries.videos, &registries.audios] {
        for asset in registry {
            let states = pipeline::variant_states(asset, &backend, &store);
            stale += states.iter().filter(|s| !s.fresh).count();
            for line in output::format_check_asset(asset, &states) {
                println!("{line}");
            }
        }
    }
    println!("==> {stale} derived file(s) need rendering");
    Ok(())
}
