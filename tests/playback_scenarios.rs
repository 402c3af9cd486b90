use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use picture_frame::config::Configuration;
use picture_frame::gateway::CommandGateway;
use picture_frame::index::{Filters, LibrarySnapshot};
use picture_frame::meta::Extracted;
use picture_frame::playlist::{PlayerState, PlaylistController, PlaylistOptions};
use picture_frame::slideshow::Slideshow;
use picture_frame::store::{Fingerprint, ImageRecord, MetadataStore};
use picture_frame::web;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::{Value, json};
use tower::ServiceExt;

const FIVE: [&str; 5] = ["/p/a.jpg", "/p/b.jpg", "/p/c.jpg", "/p/d.jpg", "/p/e.jpg"];

fn snapshot(paths: &[&str]) -> Arc<LibrarySnapshot> {
    let records = paths.iter().map(|p| ImageRecord::placeholder(*p)).collect();
    Arc::new(LibrarySnapshot::new(Filters::default(), records))
}

fn seeded_slideshow(paths: &[&str], pic_dir: &Path) -> Slideshow {
    let store = MetadataStore::open_in_memory().unwrap();
    for p in paths {
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
    config.model.pic_dir = pic_dir.to_path_buf();
    config.model.shuffle = false;
    Slideshow::new(config, store, StdRng::seed_from_u64(42))
}

#[test]
fn reshuffle_keeps_recent_images_out_of_the_head() {
    for seed in 0..32 {
        let options = PlaylistOptions {
            shuffle: true,
            recent_n: 2,
            reshuffle_num: 1,
            time_delay: Duration::from_secs(30),
            fade_time: Duration::from_secs(3),
        };
        let mut playlist = PlaylistController::new(
            options,
            PathBuf::from("/no_pictures.jpg"),
            StdRng::seed_from_u64(seed),
        );
        playlist.install_snapshot(snapshot(&FIVE), true);
        for _ in 0..3 {
            playlist.tick();
        }
        let a = playlist.current().path.clone();
        playlist.tick();
        let b = playlist.current().path.clone();

        // wrapping past the end draws the next permutation
        let epoch = playlist.epoch();
        playlist.tick();
        assert_eq!(playlist.epoch(), epoch + 1, "seed {seed}");
        let head: Vec<&Path> = playlist.ordering().into_iter().take(2).collect();
        assert!(!head.contains(&a.as_path()), "seed {seed}: {a:?} in {head:?}");
        assert!(!head.contains(&b.as_path()), "seed {seed}: {b:?} in {head:?}");
        assert_eq!(playlist.len(), 5);
    }
}

#[test]
fn empty_library_shows_placeholder_and_ignores_navigation() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let show = seeded_slideshow(&[], root);
    show.refresh_library(false);
    let status = show.status();
    assert_eq!(status.state, PlayerState::Empty);
    assert_eq!(status.current.path, show.config().model.no_files_img);
    assert!(!show.next());
    assert!(!show.back());
}

async fn get(app: axum::Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_time_delay_is_applied_and_bad_input_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let show = seeded_slideshow(&["/p/a.jpg", "/p/b.jpg"], dir.path());
    let app = web::router(CommandGateway::new(show.clone()));

    let (status, body) = get(app.clone(), "/?time_delay=5.5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "time_delay": 5.5 }));

    let (_, state) = get(app.clone(), "/?all").await;
    assert_eq!(state["time_delay"], json!(5.5));

    let (status, body) = get(app.clone(), "/?time_delay=notanumber").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.get("error").is_some());

    let (_, state) = get(app, "/?all").await;
    assert_eq!(state["time_delay"], json!(5.5));
    assert_eq!(show.status().settings.time_delay, 5.5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_subdirectory_change_restarts_playback() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir(root.join("holiday")).unwrap();
    let a = root.join("a.jpg");
    let h1 = root.join("holiday/1.jpg");
    let h2 = root.join("holiday/2.jpg");
    let paths: Vec<String> = [&a, &h1, &h2]
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    let show = seeded_slideshow(&refs, root);
    show.refresh_library(false);
    let app = web::router(CommandGateway::new(show.clone()));

    let (status, body) = get(app.clone(), "/?directory=holiday&paused=on").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "directory": "holiday", "paused": true }));

    let (_, state) = get(app, "/?all").await;
    assert_eq!(state["directory"], json!("holiday"));
    assert_eq!(state["image_counter"], json!(2));
    assert_eq!(state["position"], json!(0));
    assert_eq!(state["state"], json!("paused"));
    assert_eq!(state["image"], json!(h1.display().to_string()));
}
