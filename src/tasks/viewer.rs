use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::select;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::matting::MatTreatment;
use crate::playlist::FrameRequest;
use crate::slideshow::Slideshow;

/// One render tick's worth of input for the graphics pipeline.
#[derive(Debug, Clone)]
pub struct RenderFrame {
    pub request: FrameRequest,
    pub current_mat: Option<MatTreatment>,
    pub upcoming_mat: Option<MatTreatment>,
    pub display_on: bool,
}

/// Boundary to whatever actually draws pictures.
pub trait FrameSink: Send {
    fn present(&mut self, frame: &RenderFrame) -> Result<()>;
}

/// Headless sink that logs each picture once when it comes on screen.
#[derive(Debug, Default)]
pub struct LoggingSink {
    showing: Option<PathBuf>,
}

impl FrameSink for LoggingSink {
    fn present(&mut self, frame: &RenderFrame) -> Result<()> {
        let path = &frame.request.current.path;
        if self.showing.as_ref() != Some(path) {
            info!(
                path = %path.display(),
                state = frame.request.state.as_str(),
                display_on = frame.display_on,
                "displaying"
            );
            self.showing = Some(path.clone());
        }
        Ok(())
    }
}

/// Build the frame the renderer needs at `now`.
pub fn render_frame(slideshow: &Slideshow, now: Instant) -> RenderFrame {
    let request = slideshow.frame(now);
    let viewer = &slideshow.config().viewer;
    let current_mat = request.current.mat.map(|m| m.treatment(viewer));
    let upcoming_mat = request
        .upcoming
        .as_ref()
        .and_then(|r| r.mat)
        .map(|m| m.treatment(viewer));
    RenderFrame {
        request,
        current_mat,
        upcoming_mat,
        display_on: slideshow.settings().display_on,
    }
}

/// Pull the current frame every `1/fps` seconds and hand it to `sink`.
pub async fn run(
    slideshow: Slideshow,
    mut sink: Box<dyn FrameSink>,
    cancel: CancellationToken,
) -> Result<()> {
    let period = Duration::from_secs_f32(1.0 / slideshow.config().viewer.fps);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(?period, "render loop started");

    loop {
        select! {
            _ = cancel.cancelled() => {
                info!("cancel received; exiting viewer task");
                break;
            }
            _ = ticker.tick() => {
                let frame = render_frame(&slideshow, Instant::now());
                if let Err(err) = sink.present(&frame) {
                    warn!("frame sink error: {err:?}");
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::matting::MatDescriptor;
    use crate::meta::Extracted;
    use crate::playlist::PlayerState;
    use crate::store::{Fingerprint, MetadataStore};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    struct Recording(Arc<Mutex<Vec<RenderFrame>>>);

    impl FrameSink for Recording {
        fn present(&mut self, frame: &RenderFrame) -> Result<()> {
            self.0.lock().unwrap().push(frame.clone());
            Ok(())
        }
    }

    fn slideshow() -> Slideshow {
        let store = MetadataStore::open_in_memory().unwrap();
        let mat = MatDescriptor {
            average_rgb: [1, 2, 3],
            edge_rgb: [4, 5, 6],
            aspect_ratio: 1.5,
        };
        for p in ["/pics/a.jpg", "/pics/b.jpg"] {
            let extracted = Extracted {
                mat: Some(mat),
                ..Extracted::default()
            };
            store
                .upsert(Path::new(p), Fingerprint { size: 1, mtime_ns: 0 }, &extracted, 1)
                .unwrap();
        }
        let mut config = Configuration::default();
        config.model.shuffle = false;
        config.viewer.blur_amount = 4.0;
        Slideshow::new(config, store, StdRng::seed_from_u64(4))
    }

    #[test]
    fn frame_carries_mat_treatment_from_viewer_settings() {
        let show = slideshow();
        show.refresh_library(false);
        let frame = render_frame(&show, Instant::now());
        assert_eq!(frame.request.state, PlayerState::Playing);
        let mat = frame.current_mat.unwrap();
        assert_eq!(mat.descriptor.edge_rgb, [4, 5, 6]);
        assert_eq!(mat.blur_amount, 4.0);
        assert!(frame.upcoming_mat.is_some());
        assert!(frame.display_on);
    }

    #[test]
    fn empty_library_renders_placeholder() {
        let show = slideshow();
        let frame = render_frame(&show, Instant::now());
        assert_eq!(frame.request.state, PlayerState::Empty);
        assert_eq!(frame.request.current.path, show.config().model.no_files_img);
        assert!(frame.current_mat.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_presents_frames_until_cancelled() {
        let show = slideshow();
        show.refresh_library(false);
        let frames = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            show,
            Box::new(Recording(frames.clone())),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(!frames.lock().unwrap().is_empty());
    }
}
