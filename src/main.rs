use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use picture_frame::config::Configuration;
use picture_frame::gateway::CommandGateway;
use picture_frame::meta::MetadataExtractor;
use picture_frame::scan::LibraryScanner;
use picture_frame::slideshow::Slideshow;
use picture_frame::store::MetadataStore;
use picture_frame::tasks;
use picture_frame::web;

#[derive(Debug, Parser)]
#[command(
    name = "picture-frame",
    version,
    about = "digital picture frame slideshow"
)]
struct Args {
    /// Path to YAML config
    #[arg(value_name = "CONFIG")]
    config: PathBuf,
    /// Deterministic RNG seed for shuffle permutations (overrides model.shuffle_seed)
    #[arg(long, value_name = "SEED")]
    seed: Option<u64>,
    /// Scan the picture library into the cache once and exit
    #[arg(long = "scan-once")]
    scan_once: bool,
    /// Raise log verbosity when RUST_LOG is unset (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        config,
        seed,
        scan_once,
        verbose,
    } = Args::parse();

    // init tracing (RUST_LOG controls level, default = info)
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let mut cfg = Configuration::from_yaml_file(&config)
        .with_context(|| format!("failed to load configuration from {}", config.display()))?
        .validated()
        .context("invalid configuration values")?;

    if !cfg.model.pic_dir.is_dir() {
        bail!(
            "picture directory {} does not exist or is not a directory",
            cfg.model.pic_dir.display()
        );
    }
    cfg.model.pic_dir = cfg
        .model
        .pic_dir
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", cfg.model.pic_dir.display()))?;
    tracing::info!(
        "Loaded configuration from {}:\n{:#?}",
        config.display(),
        cfg
    );

    let store = MetadataStore::open(&cfg.model.db_file).with_context(|| {
        format!(
            "failed to open metadata store {}",
            cfg.model.db_file.display()
        )
    })?;
    let scanner = Arc::new(LibraryScanner::new(
        store.clone(),
        Arc::new(MetadataExtractor),
        cfg.model.follow_links,
    ));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl-c handler failed: {err}");
                return;
            }
            tracing::info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    if scan_once {
        let root = cfg.model.pic_dir.clone();
        let result = tokio::task::spawn_blocking(move || scanner.scan(&root, None, &cancel))
            .await
            .context("scan task panicked")?
            .context("library scan failed")?;
        tracing::info!(
            added = result.added.len(),
            updated = result.updated.len(),
            removed = result.removed.len(),
            cached = store.count()?,
            "scan-once complete"
        );
        return Ok(());
    }

    let rng = match seed.or(cfg.model.shuffle_seed) {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let slideshow = Slideshow::new(cfg.clone(), store, rng);
    let gateway = CommandGateway::new(slideshow.clone());

    let mut tasks = JoinSet::new();

    // Library scans
    tasks.spawn({
        let slideshow = slideshow.clone();
        let cancel = cancel.clone();
        async move {
            tasks::files::run(scanner, slideshow, cancel)
                .await
                .context("files task failed")
        }
    });

    // Advance timer
    tasks.spawn({
        let slideshow = slideshow.clone();
        let cancel = cancel.clone();
        async move {
            tasks::manager::run(slideshow, cancel)
                .await
                .context("manager task failed")
        }
    });

    // Render adapter
    tasks.spawn({
        let slideshow = slideshow.clone();
        let cancel = cancel.clone();
        async move {
            tasks::viewer::run(
                slideshow,
                Box::new(tasks::viewer::LoggingSink::default()),
                cancel,
            )
            .await
            .context("viewer task failed")
        }
    });

    if cfg.mqtt.use_mqtt {
        tasks.spawn({
            let mqtt = cfg.mqtt.clone();
            let gateway = gateway.clone();
            let cancel = cancel.clone();
            async move {
                tasks::mqtt::run(mqtt, gateway, cancel)
                    .await
                    .context("mqtt task failed")
            }
        });
    }

    if cfg.http.use_http {
        let ip: IpAddr = cfg
            .http
            .bind
            .parse()
            .context("http.bind must be an IP address")?;
        let bind_addr = SocketAddr::new(ip, cfg.http.port);
        tasks.spawn({
            let gateway = gateway.clone();
            let cancel = cancel.clone();
            async move {
                web::serve(gateway, bind_addr, cancel).await;
                Ok(())
            }
        });
    }

    // Drain JoinSet; a failing task stops the rest
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("task error: {e:?}");
                cancel.cancel();
            }
            Err(e) => {
                tracing::error!("join error: {e}");
                cancel.cancel();
            }
        }
    }

    Ok(())
}
