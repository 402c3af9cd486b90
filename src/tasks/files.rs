use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::select;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::error::Error;
use crate::scan::LibraryScanner;
use crate::slideshow::Slideshow;

/// Keeps the store in sync with the picture root: one pass at startup, then
/// every `check_dir_tm` seconds or whenever a rescan is requested. Deferred
/// purges run at the start of the next pass.
#[instrument(
    skip(scanner, slideshow, cancel),
    fields(root = %slideshow.config().model.pic_dir.display())
)]
pub async fn run(
    scanner: Arc<LibraryScanner>,
    slideshow: Slideshow,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = interval(slideshow.config().check_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut first = true;

    loop {
        select! {
            _ = cancel.cancelled() => {
                info!("cancel received; exiting files task");
                break;
            }
            _ = ticker.tick() => {}
            _ = slideshow.rescan_requested() => {
                info!("rescan requested");
            }
        }

        match scan_pass(&scanner, &slideshow, &cancel).await {
            Ok(()) => {}
            Err(err) => match err.downcast_ref::<Error>() {
                Some(Error::LibraryUnavailable(path)) => {
                    warn!(path = %path.display(), "picture library unavailable; keeping current snapshot");
                }
                _ => error!("scan pass failed: {err:?}"),
            },
        }
        if first {
            // show whatever the cache already holds even if the first pass failed
            let show = slideshow.clone();
            tokio::task::spawn_blocking(move || show.refresh_library(false))
                .await
                .context("initial library refresh panicked")?;
            first = false;
        }
    }
    Ok(())
}

/// One blocking scan pass followed by a snapshot refresh when anything moved.
pub async fn scan_pass(
    scanner: &Arc<LibraryScanner>,
    slideshow: &Slideshow,
    cancel: &CancellationToken,
) -> Result<()> {
    let scanner = Arc::clone(scanner);
    let show = slideshow.clone();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        if show.take_purge_request() {
            let purged = show.store().purge_missing()?;
            info!(purged, "purge of missing files complete");
        }
        let root = show.config().model.pic_dir.clone();
        let result = scanner.scan(&root, None, &cancel)?;
        if !result.is_empty() {
            show.library_changed();
        }
        Ok(())
    })
    .await
    .context("scan task panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::meta::MetadataExtractor;
    use crate::playlist::PlayerState;
    use crate::store::MetadataStore;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::fs;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn startup_pass_populates_playlist() {
        let dir = tempfile::tempdir().unwrap();
        image::RgbaImage::from_pixel(2, 2, image::Rgba([10, 20, 30, 255]))
            .save(dir.path().join("one.png"))
            .unwrap();
        fs::write(dir.path().join("notes.txt"), b"skip").unwrap();

        let store = MetadataStore::open_in_memory().unwrap();
        let mut config = Configuration::default();
        config.model.pic_dir = dir.path().to_path_buf();
        let show = Slideshow::new(config, store.clone(), StdRng::seed_from_u64(3));
        let scanner = Arc::new(LibraryScanner::new(store, Arc::new(MetadataExtractor), false));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(scanner, show.clone(), cancel.clone()));

        let mut playing = false;
        for _ in 0..100 {
            if show.status().state == PlayerState::Playing {
                playing = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("files task did not stop")
            .unwrap()
            .unwrap();
        assert!(playing);
        assert_eq!(show.status().image_counter, 1);
    }
}
