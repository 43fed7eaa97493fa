//! Update decision between two layer lists.
//!
//! Structural changes (layer count, or which source sits at a position)
//! need a full rebuild. Opacity changes are frequent (slider drags) and only
//! touch the opacity-bearing paint properties of that layer.

use serde_json::Value;

use super::StyleError;
use super::compute::{
    OPACITY_CUTOFF, compute_full_style, layer_source, opacity_props, render_layer_id,
    scale_opacity,
};
use super::types::{Layer, Style, StyleCatalog};

/// Set (`Some`) or clear (`None`) one paint property of a render layer.
#[derive(Debug, Clone, PartialEq)]
pub struct PaintCall {
    pub layer_id: String,
    pub property: String,
    pub value: Option<Value>,
}

impl PaintCall {
    pub fn new(layer_id: impl Into<String>, property: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            layer_id: layer_id.into(),
            property: property.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StyleUpdate {
    Unchanged,
    /// Replace the whole style.
    Full(Box<Style>),
    /// Mutate paint properties of existing render layers.
    Paint(Vec<PaintCall>),
}

/// Decide how to move the render engine from `prev` layers to `next`.
pub fn plan_update(
    catalog: &StyleCatalog,
    prev: &[Layer],
    next: &[Layer],
) -> Result<StyleUpdate, StyleError> {
    let structural = prev.len() != next.len()
        || prev
            .iter()
            .zip(next)
            .any(|(a, b)| a.source_id != b.source_id || a.id != b.id);
    if structural {
        return Ok(StyleUpdate::Full(Box::new(compute_full_style(catalog, next)?)));
    }

    let mut calls = Vec::new();
    for (a, b) in prev.iter().zip(next) {
        if a.opacity != b.opacity {
            calls.extend(opacity_calls(catalog, b)?);
        }
    }

    Ok(if calls.is_empty() {
        StyleUpdate::Unchanged
    } else {
        StyleUpdate::Paint(calls)
    })
}

/// Paint calls bringing every opacity-bearing property of `layer` in line
/// with its current opacity.
///
/// At or above the cutoff the template's base value is restored, or the
/// property cleared when the template leaves it unset.
fn opacity_calls(catalog: &StyleCatalog, layer: &Layer) -> Result<Vec<PaintCall>, StyleError> {
    let source = layer_source(catalog, &layer.source_id)?;
    let mut calls = Vec::new();
    for spec in &source.layer_specs {
        let id = render_layer_id(layer, &spec.id);
        for prop in opacity_props(&spec.kind) {
            let base = spec.paint.get(*prop);
            let value = if layer.opacity < OPACITY_CUTOFF {
                Some(scale_opacity(base, layer.opacity))
            } else {
                base.cloned()
            };
            calls.push(PaintCall::new(id.clone(), *prop, value));
        }
    }
    Ok(calls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::style::types::{LayerSource, RenderLayer};
    use serde_json::json;

    fn catalog() -> StyleCatalog {
        StyleCatalog::default()
            .with_layer_source(LayerSource {
                id: "base".into(),
                dependencies: vec![],
                glyphs: None,
                sprite: None,
                layer_specs: vec![RenderLayer::new("bg", "background")],
            })
            .with_layer_source(LayerSource {
                id: "roads".into(),
                dependencies: vec![],
                glyphs: None,
                sprite: None,
                layer_specs: vec![
                    RenderLayer::new("casing", "line").with_paint("line-opacity", json!(0.5)),
                    RenderLayer::new("names", "symbol"),
                ],
            })
    }

    #[test]
    fn test_opacity_only_change_emits_paint_calls() {
        let prev = [Layer::new("base", 1.0), Layer::new("roads", 1.0)];
        let next = [Layer::new("base", 1.0), Layer::new("roads", 0.5)];

        let update = plan_update(&catalog(), &prev, &next).unwrap();
        assert_eq!(
            update,
            StyleUpdate::Paint(vec![PaintCall::new(
                "roads-casing",
                "line-opacity",
                Some(json!(0.25))
            )])
        );
    }

    #[test]
    fn test_first_position_is_updated() {
        let prev = [Layer::new("base", 1.0)];
        let next = [Layer::new("base", 0.5)];
        let update = plan_update(&catalog(), &prev, &next).unwrap();
        assert_eq!(
            update,
            StyleUpdate::Paint(vec![PaintCall::new(
                "base-bg",
                "background-opacity",
                Some(json!(0.5))
            )])
        );
    }

    #[test]
    fn test_back_to_opaque_restores_base() {
        let prev = [Layer::new("base", 0.5), Layer::new("roads", 0.5)];
        let next = [Layer::new("base", 1.0), Layer::new("roads", 1.0)];
        let update = plan_update(&catalog(), &prev, &next).unwrap();
        assert_eq!(
            update,
            StyleUpdate::Paint(vec![
                PaintCall::new("base-bg", "background-opacity", None),
                PaintCall::new("roads-casing", "line-opacity", Some(json!(0.5))),
            ])
        );
    }

    #[test]
    fn test_full_rebuild_triggers() {
        let catalog = catalog();
        let one = [Layer::new("base", 1.0)];
        let two = [Layer::new("base", 1.0), Layer::new("roads", 1.0)];
        let swapped = [Layer::new("roads", 1.0), Layer::new("base", 1.0)];

        assert!(matches!(
            plan_update(&catalog, &one, &two).unwrap(),
            StyleUpdate::Full(_)
        ));
        assert!(matches!(
            plan_update(&catalog, &two, &one).unwrap(),
            StyleUpdate::Full(_)
        ));
        assert!(matches!(
            plan_update(&catalog, &two, &swapped).unwrap(),
            StyleUpdate::Full(_)
        ));
    }

    #[test]
    fn test_unchanged() {
        let layers = [Layer::new("base", 0.7)];
        assert_eq!(
            plan_update(&catalog(), &layers, &layers).unwrap(),
            StyleUpdate::Unchanged
        );
    }
}
