use anyhow::Result;
use tokio::select;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::slideshow::Slideshow;

/// Paces the show. Sleeps until the playlist's next advance deadline and
/// re-reads it whenever timing, pause state or the snapshot changes.
pub async fn run(slideshow: Slideshow, cancel: CancellationToken) -> Result<()> {
    loop {
        let deadline = slideshow.next_advance_at();
        select! {
            _ = cancel.cancelled() => {
                info!("cancel received; exiting manager task");
                break;
            }
            _ = slideshow.timer_changed() => {
                debug!("advance timer rearmed");
            }
            _ = wait_for(deadline) => {
                if let Some(path) = slideshow.tick_due(std::time::Instant::now()) {
                    debug!(path = %path.display(), "timed advance");
                    let show = slideshow.clone();
                    tokio::task::spawn_blocking(move || show.record_displayed(&path)).await?;
                }
            }
        }
    }
    Ok(())
}

async fn wait_for(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(at) => sleep_until(Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::meta::Extracted;
    use crate::store::{Fingerprint, MetadataStore};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn advances_after_time_delay() {
        let store = MetadataStore::open_in_memory().unwrap();
        for p in ["/pics/a.jpg", "/pics/b.jpg"] {
            store
                .upsert(
                    Path::new(p),
                    Fingerprint { size: 1, mtime_ns: 0 },
                    &Extracted::default(),
                    1,
                )
                .unwrap();
        }
        let mut config = Configuration::default();
        config.model.pic_dir = PathBuf::from("/pics");
        config.model.shuffle = false;
        config.model.time_delay = 1.0;
        config.model.fade_time = 0.0;
        let show = Slideshow::new(config, store.clone(), StdRng::seed_from_u64(9));
        show.refresh_library(false);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(show.clone(), cancel.clone()));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(show.status().current.path, PathBuf::from("/pics/b.jpg"));

        show.set_paused(true);
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(show.status().current.path, PathBuf::from("/pics/b.jpg"));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("manager task did not stop")
            .unwrap()
            .unwrap();
        let shown = store.get(Path::new("/pics/b.jpg")).unwrap().unwrap();
        assert_eq!(shown.displayed_count, 1);
    }
}
