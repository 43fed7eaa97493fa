//! Applying state to a render engine.
//!
//! `MapRenderer` compares each rendered snapshot with the previous one and
//! issues the smallest set of engine calls: paint calls for opacity changes,
//! structural ops for the feature layers, a geometry upload only when the
//! feature map changed, and sprite registration for new images. Any step
//! that cannot be applied incrementally falls back to a full rebuild.
//!
//! State changes can arrive much faster than frames. `FrameSlot` keeps only
//! the latest requested snapshot, and `run_frames` renders it once per tick.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

use super::StyleError;
use super::compute::compute_full_style;
use super::diff::{RenderOp, diff_render_layers};
use super::types::{RenderLayer, Style};
use super::update::{PaintCall, StyleUpdate, plan_update};
use crate::feature::select::features_geojson;
use crate::feature::{FeatureKind, FeatureStore};
use crate::state::AppState;
use crate::{debug, log};

/// Source id of the feature geometry.
pub const FEATURES_SOURCE: &str = "features";

/// Style keys that belong in a symbol layer's `layout` rather than `paint`.
const LAYOUT_KEYS: &[&str] = &["icon-image", "icon-size", "text-field", "text-size"];

/// Contract of the map rendering engine.
pub trait RenderEngine: Send {
    fn set_style(&mut self, style: &Style);
    /// Insert `layer` below `before`, or on top when `None`.
    fn add_layer(&mut self, layer: &RenderLayer, before: Option<&str>);
    fn remove_layer(&mut self, id: &str);
    fn set_paint_property(&mut self, layer_id: &str, property: &str, value: Option<&Value>);
    fn has_layer(&self, id: &str) -> bool;
    fn add_image(&mut self, id: &str, url: &str);
    fn set_geojson(&mut self, source_id: &str, data: &Value);
}

pub struct MapRenderer<E> {
    engine: E,
    prev: Option<Arc<AppState>>,
    feature_layers: Vec<RenderLayer>,
    added_sprites: FxHashSet<String>,
}

impl<E: RenderEngine> MapRenderer<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            prev: None,
            feature_layers: Vec::new(),
            added_sprites: FxHashSet::default(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Bring the engine in line with `state`.
    pub fn render(&mut self, state: &Arc<AppState>) -> Result<(), StyleError> {
        let Some(prev) = self.prev.clone() else {
            self.rebuild(state)?;
            self.prev = Some(Arc::clone(state));
            return Ok(());
        };
        if Arc::ptr_eq(&prev, state) {
            return Ok(());
        }

        if let Err(e) = self.render_incremental(&prev, state) {
            match e {
                StyleError::UnsupportedDelta { .. } | StyleError::MissingRenderLayer(_) => {
                    log!("style"; "{}, rebuilding", e);
                    self.rebuild(state)?;
                }
                e => return Err(e),
            }
        }
        self.add_sprites(state);
        self.prev = Some(Arc::clone(state));
        Ok(())
    }

    fn render_incremental(&mut self, prev: &AppState, next: &AppState) -> Result<(), StyleError> {
        let catalog_changed = !Arc::ptr_eq(&prev.catalog, &next.catalog);
        if catalog_changed || prev.sync.layers != next.sync.layers {
            let update = if catalog_changed {
                StyleUpdate::Full(Box::new(compute_full_style(&next.catalog, &next.sync.layers)?))
            } else {
                plan_update(&next.catalog, &prev.sync.layers, &next.sync.layers)?
            };
            match update {
                StyleUpdate::Unchanged => {}
                StyleUpdate::Full(_) => return self.rebuild(next),
                StyleUpdate::Paint(calls) => self.apply_paint(&calls)?,
            }
        }

        let features = next.features();
        if !prev.features().same_features(features) {
            let layers = feature_layers(features);
            if layers != self.feature_layers {
                let ops = diff_render_layers(&self.feature_layers, &layers)?;
                self.apply_ops(&ops)?;
                self.feature_layers = layers;
            }
            self.engine
                .set_geojson(FEATURES_SOURCE, &features_geojson(features));
        }
        Ok(())
    }

    /// Replace the whole style, feature layers and geometry included.
    fn rebuild(&mut self, state: &AppState) -> Result<(), StyleError> {
        let mut style = compute_full_style(&state.catalog, &state.sync.layers)?;
        style.sources.insert(
            FEATURES_SOURCE.to_string(),
            json!({"type": "geojson", "data": features_geojson(state.features())}),
        );
        let layers = feature_layers(state.features());
        style.layers.extend(layers.iter().cloned());

        debug!("style"; "full rebuild with {} render layers", style.layers.len());
        self.engine.set_style(&style);
        self.feature_layers = layers;

        // Images do not survive a style swap
        self.added_sprites.clear();
        self.add_sprites(state);
        Ok(())
    }

    fn apply_paint(&mut self, calls: &[PaintCall]) -> Result<(), StyleError> {
        if let Some(call) = calls.iter().find(|c| !self.engine.has_layer(&c.layer_id)) {
            return Err(StyleError::MissingRenderLayer(call.layer_id.clone()));
        }
        debug!("style"; "{} paint updates", calls.len());
        for call in calls {
            self.engine
                .set_paint_property(&call.layer_id, &call.property, call.value.as_ref());
        }
        Ok(())
    }

    fn apply_ops(&mut self, ops: &[RenderOp]) -> Result<(), StyleError> {
        for op in ops {
            if let RenderOp::SetPaint(call) = op
                && !self.engine.has_layer(&call.layer_id)
            {
                return Err(StyleError::MissingRenderLayer(call.layer_id.clone()));
            }
        }
        for op in ops {
            match op {
                RenderOp::Remove { id } => self.engine.remove_layer(id),
                RenderOp::SetPaint(call) => {
                    self.engine
                        .set_paint_property(&call.layer_id, &call.property, call.value.as_ref())
                }
                RenderOp::Add { layer, before } => self.engine.add_layer(layer, before.as_deref()),
            }
        }
        Ok(())
    }

    fn add_sprites(&mut self, state: &AppState) {
        for (id, url) in state.sprites.iter() {
            if self.added_sprites.insert(id.clone()) {
                self.engine.add_image(id, url);
            }
        }
    }
}

/// Render layers drawing the feature geometry, above every map layer.
///
/// Routes and points get one layer each. A group with a `childPointStyle`
/// gets a symbol layer restyling its direct child points.
pub fn feature_layers(store: &FeatureStore) -> Vec<RenderLayer> {
    let source = Value::String(FEATURES_SOURCE.to_string());
    let mut layers = vec![
        RenderLayer::new("feature-routes", "line")
            .with("source", source.clone())
            .with("filter", json!(["==", ["get", "type"], "route"]))
            .with_paint("line-color", json!("#3a7bd5"))
            .with_paint("line-width", json!(3)),
        RenderLayer::new("feature-points", "circle")
            .with("source", source.clone())
            .with("filter", json!(["==", ["get", "type"], "point"]))
            .with_paint("circle-radius", json!(5))
            .with_paint("circle-color", json!("#e8553e")),
    ];

    let mut groups: Vec<_> = store
        .features()
        .values()
        .filter(|f| f.kind == FeatureKind::Group)
        .filter_map(|f| Some((f, f.prop("childPointStyle")?.as_object()?)))
        .collect();
    groups.sort_by(|(a, _), (b, _)| a.at.cmp(&b.at).then_with(|| a.id.cmp(&b.id)));

    for (group, style) in groups {
        let mut layout = Map::new();
        let mut layer = RenderLayer::new(format!("feature-group-{}", group.id), "symbol")
            .with("source", source.clone())
            .with("filter", json!(["==", ["get", "parentId"], group.id]));
        for (key, value) in style {
            if LAYOUT_KEYS.contains(&key.as_str()) {
                layout.insert(key.clone(), value.clone());
            } else {
                layer.paint.insert(key.clone(), value.clone());
            }
        }
        if !layout.is_empty() {
            layer = layer.with("layout", Value::Object(layout));
        }
        layers.push(layer);
    }
    layers
}

// =============================================================================
// Frame Scheduling
// =============================================================================

/// Latest snapshot waiting for the next frame.
#[derive(Default)]
pub struct FrameSlot {
    pending: Mutex<Option<Arc<AppState>>>,
}

impl FrameSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Ask for `state` to be drawn. Replaces any snapshot not drawn yet.
    pub fn request(&self, state: Arc<AppState>) {
        *self.pending.lock() = Some(state);
    }

    pub fn take(&self) -> Option<Arc<AppState>> {
        self.pending.lock().take()
    }
}

/// Render the pending snapshot once per `interval` until `stop` flips.
pub async fn run_frames<E: RenderEngine>(
    slot: Arc<FrameSlot>,
    mut renderer: MapRenderer<E>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> MapRenderer<E> {
    let mut ticker = time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(state) = slot.take()
                    && let Err(e) = renderer.render(&state)
                {
                    log!("style"; "render failed: {}", e);
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
    renderer
}

// =============================================================================
// Engines
// =============================================================================

/// Headless engine that tracks layer ids and logs every call.
#[derive(Debug, Default)]
pub struct LogEngine {
    layers: Vec<String>,
    images: usize,
}

impl LogEngine {
    pub fn layer_ids(&self) -> &[String] {
        &self.layers
    }
}

impl RenderEngine for LogEngine {
    fn set_style(&mut self, style: &Style) {
        self.layers = style.layers.iter().map(|l| l.id.clone()).collect();
        debug!("style"; "set style: {} sources, {} layers", style.sources.len(), self.layers.len());
    }

    fn add_layer(&mut self, layer: &RenderLayer, before: Option<&str>) {
        let at = before
            .and_then(|b| self.layers.iter().position(|id| id == b))
            .unwrap_or(self.layers.len());
        self.layers.insert(at, layer.id.clone());
        debug!("style"; "add layer {} before {:?}", layer.id, before);
    }

    fn remove_layer(&mut self, id: &str) {
        self.layers.retain(|l| l != id);
        debug!("style"; "remove layer {}", id);
    }

    fn set_paint_property(&mut self, layer_id: &str, property: &str, value: Option<&Value>) {
        debug!("style"; "paint {}.{} = {:?}", layer_id, property, value);
    }

    fn has_layer(&self, id: &str) -> bool {
        self.layers.iter().any(|l| l == id)
    }

    fn add_image(&mut self, id: &str, url: &str) {
        self.images += 1;
        debug!("style"; "image {} from {}", id, url);
    }

    fn set_geojson(&mut self, source_id: &str, data: &Value) {
        let count = data
            .get("features")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        debug!("style"; "{} geometry: {} features", source_id, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{At, Feature};
    use crate::state::{Action, reduce};
    use crate::style::types::{Layer, LayerSource, StyleCatalog};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        SetStyle(Vec<String>),
        Add(String, Option<String>),
        Remove(String),
        Paint(String, String, Option<Value>),
        Image(String),
        Geojson(usize),
    }

    #[derive(Default)]
    struct RecordingEngine {
        inner: LogEngine,
        calls: Vec<Call>,
    }

    impl RenderEngine for RecordingEngine {
        fn set_style(&mut self, style: &Style) {
            self.inner.set_style(style);
            self.calls
                .push(Call::SetStyle(style.layers.iter().map(|l| l.id.clone()).collect()));
        }
        fn add_layer(&mut self, layer: &RenderLayer, before: Option<&str>) {
            self.inner.add_layer(layer, before);
            self.calls
                .push(Call::Add(layer.id.clone(), before.map(str::to_string)));
        }
        fn remove_layer(&mut self, id: &str) {
            self.inner.remove_layer(id);
            self.calls.push(Call::Remove(id.to_string()));
        }
        fn set_paint_property(&mut self, layer_id: &str, property: &str, value: Option<&Value>) {
            self.calls.push(Call::Paint(
                layer_id.to_string(),
                property.to_string(),
                value.cloned(),
            ));
        }
        fn has_layer(&self, id: &str) -> bool {
            self.inner.has_layer(id)
        }
        fn add_image(&mut self, id: &str, _url: &str) {
            self.calls.push(Call::Image(id.to_string()));
        }
        fn set_geojson(&mut self, _source_id: &str, data: &Value) {
            let count = data["features"].as_array().map_or(0, Vec::len);
            self.calls.push(Call::Geojson(count));
        }
    }

    fn catalog() -> StyleCatalog {
        StyleCatalog::default().with_layer_source(LayerSource {
            id: "roads".into(),
            dependencies: vec![],
            glyphs: None,
            sprite: None,
            layer_specs: vec![RenderLayer::new("casing", "line").with_paint("line-opacity", json!(0.5))],
        })
    }

    fn initial() -> Arc<AppState> {
        Arc::new(AppState::new(catalog(), vec![Layer::new("roads", 1.0)]))
    }

    fn step(state: &Arc<AppState>, action: Action) -> Arc<AppState> {
        Arc::new(reduce(state, action).unwrap().unwrap())
    }

    fn calls(renderer: &mut MapRenderer<RecordingEngine>) -> Vec<Call> {
        std::mem::take(&mut renderer.engine.calls)
    }

    #[test]
    fn test_first_frame_is_full_rebuild() {
        let mut renderer = MapRenderer::new(RecordingEngine::default());
        renderer.render(&initial()).unwrap();
        assert_eq!(
            calls(&mut renderer),
            vec![Call::SetStyle(vec![
                "roads-casing".into(),
                "feature-routes".into(),
                "feature-points".into(),
            ])]
        );
    }

    #[test]
    fn test_opacity_change_is_paint_only() {
        let mut renderer = MapRenderer::new(RecordingEngine::default());
        let state = initial();
        renderer.render(&state).unwrap();
        calls(&mut renderer);

        let state = step(&state, Action::SetLayerOpacity { index: 0, opacity: 0.5 });
        renderer.render(&state).unwrap();
        assert_eq!(
            calls(&mut renderer),
            vec![Call::Paint(
                "roads-casing".into(),
                "line-opacity".into(),
                Some(json!(0.25))
            )]
        );
    }

    #[test]
    fn test_feature_change_uploads_geometry_once() {
        let mut renderer = MapRenderer::new(RecordingEngine::default());
        let state = initial();
        renderer.render(&state).unwrap();
        calls(&mut renderer);

        let state = step(
            &state,
            Action::CreatePoint {
                id: "p".into(),
                at: At::parse("root.V").unwrap(),
                lng_lat: [1.0, 2.0],
            },
        );
        renderer.render(&state).unwrap();
        assert_eq!(calls(&mut renderer), vec![Call::Geojson(1)]);

        // Selection only: nothing to draw
        let state = step(&state, Action::SetActive(None));
        renderer.render(&state).unwrap();
        assert!(calls(&mut renderer).is_empty());
    }

    #[test]
    fn test_group_style_adds_symbol_layer_on_top() {
        let mut renderer = MapRenderer::new(RecordingEngine::default());
        let state = step(&initial(), Action::CreateGroup { id: "g".into() });
        renderer.render(&state).unwrap();
        calls(&mut renderer);

        let update = json!({"childPointStyle": {"icon-image": "maki-park", "icon-color": "red"}});
        let state = step(
            &state,
            Action::UpdateFeature {
                id: "g".into(),
                update: update.as_object().unwrap().clone(),
            },
        );
        renderer.render(&state).unwrap();
        assert_eq!(
            calls(&mut renderer),
            vec![Call::Add("feature-group-g".into(), None), Call::Geojson(0)]
        );
        assert_eq!(
            renderer.engine().inner.layer_ids().last().map(String::as_str),
            Some("feature-group-g")
        );
    }

    #[test]
    fn test_unsupported_feature_layer_change_rebuilds() {
        let mut renderer = MapRenderer::new(RecordingEngine::default());
        let style = |image: &str| {
            let update = json!({"childPointStyle": {"icon-image": image}});
            Action::UpdateFeature {
                id: "g".into(),
                update: update.as_object().unwrap().clone(),
            }
        };
        let state = step(&initial(), Action::CreateGroup { id: "g".into() });
        let state = step(&state, style("a"));
        renderer.render(&state).unwrap();
        calls(&mut renderer);

        // Layout change cannot be expressed as paint calls
        let state = step(&state, style("b"));
        renderer.render(&state).unwrap();
        let made = calls(&mut renderer);
        assert!(matches!(made.as_slice(), [Call::SetStyle(_)]));
    }

    #[test]
    fn test_layer_reorder_rebuilds() {
        let catalog = catalog().with_layer_source(LayerSource {
            id: "water".into(),
            dependencies: vec![],
            glyphs: None,
            sprite: None,
            layer_specs: vec![RenderLayer::new("fill", "fill")],
        });
        let state = Arc::new(AppState::new(
            catalog,
            vec![Layer::new("roads", 1.0), Layer::new("water", 1.0)],
        ));
        let mut renderer = MapRenderer::new(RecordingEngine::default());
        renderer.render(&state).unwrap();
        calls(&mut renderer);

        let state = step(&state, Action::MoveLayer { from: 1, to: 0 });
        renderer.render(&state).unwrap();
        assert_eq!(
            calls(&mut renderer),
            vec![Call::SetStyle(vec![
                "water-fill".into(),
                "roads-casing".into(),
                "feature-routes".into(),
                "feature-points".into(),
            ])]
        );
    }

    #[test]
    fn test_sprites_added_once() {
        let mut renderer = MapRenderer::new(RecordingEngine::default());
        let state = step(
            &initial(),
            Action::AddSprites(vec![("maki-park".into(), "https://x/park.png".into())]),
        );
        renderer.render(&state).unwrap();
        assert!(calls(&mut renderer).contains(&Call::Image("maki-park".into())));

        let state = step(
            &state,
            Action::AddSprites(vec![("maki-cafe".into(), "https://x/cafe.png".into())]),
        );
        renderer.render(&state).unwrap();
        assert_eq!(calls(&mut renderer), vec![Call::Image("maki-cafe".into())]);
    }

    #[test]
    fn test_feature_layers_split_layout_and_paint() {
        let mut store = FeatureStore::new();
        store.insert(
            Feature::new("g", FeatureKind::Group, At::parse("root.V").unwrap()).with_prop(
                "childPointStyle",
                json!({"icon-image": "maki-park", "icon-opacity": 0.5}),
            ),
        );
        let layers = feature_layers(&store);
        let group = &layers[2];
        assert_eq!(group.id, "feature-group-g");
        assert_eq!(group.paint.get("icon-opacity"), Some(&json!(0.5)));
        assert_eq!(group.rest["layout"], json!({"icon-image": "maki-park"}));
        assert_eq!(group.rest["filter"], json!(["==", ["get", "parentId"], "g"]));
    }

    #[tokio::test]
    async fn test_frame_slot_coalesces() {
        let slot = FrameSlot::new();
        let first = initial();
        let last = step(&first, Action::SetLayerOpacity { index: 0, opacity: 0.2 });
        slot.request(Arc::clone(&first));
        slot.request(Arc::clone(&last));

        let (stop_tx, stop) = watch::channel(false);
        let task = tokio::spawn(run_frames(
            Arc::clone(&slot),
            MapRenderer::new(RecordingEngine::default()),
            Duration::from_millis(5),
            stop,
        ));
        time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        let mut renderer = task.await.unwrap();

        // Only the latest snapshot is drawn, as a single rebuild
        assert_eq!(calls(&mut renderer).len(), 1);
        assert!(Arc::ptr_eq(renderer.prev.as_ref().unwrap(), &last));
    }
}
