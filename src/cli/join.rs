//! `topomap join`: run a headless replica of one session.
//!
//! ```text
//!   Store ──► SyncEngine ──► WsTransport ──► relay
//!     │
//!     └──► FrameSlot ──► run_frames ──► MapRenderer<LogEngine>
//! ```
//!
//! Runs until Ctrl+C, printing the connection status as it changes.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{Notify, watch};

use crate::cli::shutdown::shutdown_signal;
use crate::cli::style::load_scene;
use crate::config::TopomapConfig;
use crate::feature::select::common_sprites;
use crate::logger::{status_error, status_pending, status_success};
use crate::state::{Action, AppState, Store};
use crate::style::render::{LogEngine, run_frames};
use crate::style::{FrameSlot, MapRenderer, Scene};
use crate::sync::cache::session_key;
use crate::sync::transport::session_url;
use crate::sync::{ConnectionStatus, DurableCache, FileCache, SyncEngine, Transport, WsTransport};
use crate::{debug, log};

pub async fn join_session(
    config: &TopomapConfig,
    session: &str,
    scene: Option<&Path>,
) -> Result<()> {
    let scene = match scene {
        Some(path) => load_scene(path)?,
        None => Scene::default(),
    };
    let store = Arc::new(Store::new(AppState::new(scene.catalog, scene.layers)));

    let url = session_url(&config.sync.server, session)?;
    let backoff = config.sync.backoff();
    let engine = SyncEngine::open(
        Arc::clone(&store),
        session,
        config.sync.options(),
        open_cache(config, session),
        move |events| -> Arc<dyn Transport> {
            Arc::new(WsTransport::connect(url, backoff, events))
        },
    );

    let sprite_url = config.render.sprite_url.as_str();
    register_common_sprites(&store, sprite_url);

    let slot = FrameSlot::new();
    slot.request(store.state());
    let frames_slot = Arc::clone(&slot);
    let features_changed = Arc::new(Notify::new());
    let notify = Arc::clone(&features_changed);
    let subscription = store.subscribe(move |t| {
        frames_slot.request(Arc::clone(&t.next));
        if !t.prev.features().same_features(t.next.features()) {
            notify.notify_one();
        }
    });

    let (stop_tx, stop_rx) = watch::channel(false);
    let frames = tokio::spawn(run_frames(
        slot,
        MapRenderer::new(LogEngine::default()),
        config.render.frame_interval(),
        stop_rx,
    ));

    let mut status = engine.status();
    let mut shutdown = shutdown_signal();
    report_status(session, *status.borrow_and_update());
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                report_status(session, *status.borrow_and_update());
            }
            _ = features_changed.notified() => register_common_sprites(&store, sprite_url),
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
    }

    store.unsubscribe(subscription);
    stop_tx.send_replace(true);
    let renderer = frames.await.context("render task failed")?;
    engine.close().await;

    let state = store.state();
    log!(
        "sync";
        "left {} with {} features, {} layers",
        session,
        state.features().len(),
        state.sync.layers.len()
    );
    debug!("style"; "final render layers: {:?}", renderer.engine().layer_ids());
    Ok(())
}

/// Register the most used icons so the renderer can draw them.
fn register_common_sprites(store: &Store, sprite_url: &str) {
    let result = store.dispatch_with(|state| {
        let sprites: Vec<(String, String)> = common_sprites(state.features())
            .into_iter()
            .filter(|id| !state.sprites.contains_key(id))
            .map(|id| {
                let url = sprite_image_url(sprite_url, &id);
                (id, url)
            })
            .collect();
        (!sprites.is_empty()).then_some(Action::AddSprites(sprites))
    });
    if let Err(e) = result {
        log!("style"; "cannot register sprites: {}", e);
    }
}

/// `feature:maki-star` under `/sprite` is `/sprite/maki-star.png`.
fn sprite_image_url(base: &str, id: &str) -> String {
    let name = id.rsplit_once(':').map_or(id, |(_, name)| name);
    format!("{}/{}.png", base.trim_end_matches('/'), name)
}

/// File cache for `session`, or `None` when disabled or unusable.
fn open_cache(config: &TopomapConfig, session: &str) -> Option<Box<dyn DurableCache>> {
    if !config.cache.enable {
        return None;
    }
    match FileCache::open(&config.cache_dir(), session_key(session)) {
        Ok(cache) => {
            debug!("cache"; "using {}", cache.path().display());
            Some(Box::new(cache))
        }
        Err(e) => {
            log!("cache"; "running without cache: {}", e);
            None
        }
    }
}

fn report_status(session: &str, status: ConnectionStatus) {
    match status {
        ConnectionStatus::Connected => status_success(&format!("{session}: connected")),
        ConnectionStatus::Connecting => status_pending(&format!("{session}: connecting")),
        ConnectionStatus::Disconnected => status_error(&format!("{session}: disconnected")),
    }
}
