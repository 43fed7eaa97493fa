//! Style inputs and outputs.
//!
//! Inputs are the shared catalog (data sources and layer-source templates,
//! loaded once) plus the per-session layer list. The output mirrors the
//! render engine's style document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Known attribution strings a data source can refer to by key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Attribution {
    Os,
    Mapbox,
}

impl Attribution {
    /// Resolved attribution HTML for the given year.
    pub fn resolve(self, year: i32) -> String {
        match self {
            Self::Os => {
                format!("Contains OS data &copy; Crown copyright and database rights {year}")
            }
            Self::Mapbox => concat!(
                r#"© <a href="https://www.mapbox.com/about/maps/">Mapbox</a> "#,
                r#"© <a href="http://www.openstreetmap.org/copyright">OpenStreetMap</a> "#,
                r#"<strong><a href="https://www.mapbox.com/map-feedback/" target="_blank">Improve this map</a></strong>"#,
            )
            .to_string(),
        }
    }
}

/// A tile or GeoJSON source the render engine can load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution: Option<Attribution>,
    /// Render-engine source spec, passed through untouched.
    pub spec: Map<String, Value>,
}

/// Immutable template of render layers plus the data sources they read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerSource {
    pub id: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glyphs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprite: Option<String>,
    #[serde(default)]
    pub layer_specs: Vec<RenderLayer>,
}

/// A user-visible layer: a layer source shown at some opacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layer {
    /// Namespace for the expanded render layer ids. Falls back to
    /// `source_id` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source_id: String,
    #[serde(default = "full_opacity")]
    pub opacity: f64,
}

fn full_opacity() -> f64 {
    1.0
}

impl Layer {
    pub fn new(source_id: impl Into<String>, opacity: f64) -> Self {
        Self {
            id: None,
            source_id: source_id.into(),
            opacity,
        }
    }

    pub fn namespace(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.source_id)
    }
}

/// One render-engine layer.
///
/// `paint` is always present in the serialized form so paint-property
/// diffs line up between templates with and without one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderLayer {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub paint: Map<String, Value>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl RenderLayer {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            paint: Map::new(),
            rest: Map::new(),
        }
    }

    pub fn with_paint(mut self, key: impl Into<String>, value: Value) -> Self {
        self.paint.insert(key.into(), value);
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.rest.insert(key.into(), value);
        self
    }
}

/// Full style document handed to the render engine on rebuild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Style {
    pub version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glyphs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprite: Option<String>,
    pub sources: Map<String, Value>,
    pub layers: Vec<RenderLayer>,
}

/// Shared configuration: every known data source and layer source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleCatalog {
    #[serde(default)]
    pub data_sources: BTreeMap<String, DataSource>,
    #[serde(default)]
    pub layer_sources: BTreeMap<String, LayerSource>,
}

impl StyleCatalog {
    pub fn with_data_source(mut self, source: DataSource) -> Self {
        self.data_sources.insert(source.id.clone(), source);
        self
    }

    pub fn with_layer_source(mut self, source: LayerSource) -> Self {
        self.layer_sources.insert(source.id.clone(), source);
        self
    }
}

/// Catalog plus a layer list, as read by `topomap style`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scene {
    #[serde(flatten)]
    pub catalog: StyleCatalog,
    #[serde(default)]
    pub layers: Vec<Layer>,
}
