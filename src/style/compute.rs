//! Full style computation.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value, json};

use super::StyleError;
use super::types::{Layer, LayerSource, RenderLayer, Style, StyleCatalog};

/// Layers at or above this opacity are drawn as fully opaque.
pub const OPACITY_CUTOFF: f64 = 0.95;

/// Paint properties scaled by layer opacity, per render layer type.
///
/// Symbol layers are left alone: scaling icon and text opacity makes labels
/// unreadable long before the layer underneath fades out.
pub fn opacity_props(kind: &str) -> &'static [&'static str] {
    match kind {
        "background" => &["background-opacity"],
        "fill" => &["fill-opacity"],
        "line" => &["line-opacity"],
        "raster" => &["raster-opacity"],
        "circle" => &["circle-opacity", "circle-stroke-opacity"],
        "fill-extrusion" => &["fill-extrusion-opacity"],
        "heatmap" => &["heatmap-opacity"],
        "hillshade" => &["hillshade-exaggeration"],
        _ => &[],
    }
}

/// Compute the complete style for `layers`.
///
/// Only data sources some layer depends on are emitted. Glyphs and sprite
/// come from the first layer source that declares them.
pub fn compute_full_style(catalog: &StyleCatalog, layers: &[Layer]) -> Result<Style, StyleError> {
    compute_full_style_in(catalog, layers, current_year())
}

pub(crate) fn compute_full_style_in(
    catalog: &StyleCatalog,
    layers: &[Layer],
    year: i32,
) -> Result<Style, StyleError> {
    let sources: Vec<&LayerSource> = layers
        .iter()
        .map(|layer| layer_source(catalog, &layer.source_id))
        .collect::<Result<_, _>>()?;

    let glyphs = sources.iter().find_map(|s| s.glyphs.clone().filter(|g| !g.is_empty()));
    let sprite = sources.iter().find_map(|s| s.sprite.clone().filter(|s| !s.is_empty()));

    let mut data_sources = Map::new();
    for id in sources.iter().copied().flat_map(|s| &s.dependencies) {
        if data_sources.contains_key(id) {
            continue;
        }
        let source = catalog
            .data_sources
            .get(id)
            .ok_or_else(|| StyleError::UnknownDataSource(id.clone()))?;
        let mut spec = source.spec.clone();
        if let Some(attribution) = source.attribution {
            spec.insert("attribution".into(), Value::String(attribution.resolve(year)));
        }
        data_sources.insert(source.id.clone(), Value::Object(spec));
    }

    let mut render_layers = Vec::new();
    for (layer, source) in layers.iter().zip(&sources) {
        render_layers.extend(expand_layer(layer, source));
    }

    Ok(Style {
        version: 8,
        glyphs,
        sprite,
        sources: data_sources,
        layers: render_layers,
    })
}

pub(crate) fn layer_source<'a>(
    catalog: &'a StyleCatalog,
    id: &str,
) -> Result<&'a LayerSource, StyleError> {
    catalog
        .layer_sources
        .get(id)
        .ok_or_else(|| StyleError::UnknownLayerSource(id.to_string()))
}

/// Render-engine id of a template layer expanded under `layer`.
pub fn render_layer_id(layer: &Layer, template_id: &str) -> String {
    format!("{}-{}", layer.namespace(), template_id)
}

/// Expand a layer source's templates for one layer, applying its opacity.
pub fn expand_layer(layer: &Layer, source: &LayerSource) -> Vec<RenderLayer> {
    source
        .layer_specs
        .iter()
        .map(|spec| {
            let mut out = spec.clone();
            out.id = render_layer_id(layer, &spec.id);
            if layer.opacity < OPACITY_CUTOFF {
                for prop in opacity_props(&spec.kind) {
                    let scaled = scale_opacity(spec.paint.get(*prop), layer.opacity);
                    out.paint.insert((*prop).to_string(), scaled);
                }
            }
            out
        })
        .collect()
}

/// Base paint value multiplied by `opacity`; an unset base counts as 1.
///
/// Expression values cannot be multiplied here, so they are wrapped in a
/// `*` expression for the render engine to evaluate.
pub fn scale_opacity(base: Option<&Value>, opacity: f64) -> Value {
    match base {
        None | Some(Value::Null) => json!(opacity),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(n) => json!(n * opacity),
            None => json!(opacity),
        },
        Some(expr) => json!(["*", expr, opacity]),
    }
}

fn current_year() -> i32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    year_of_day(i64::try_from(secs / 86_400).unwrap_or(0))
}

/// Gregorian year of a day count since 1970-01-01.
fn year_of_day(days: i64) -> i32 {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let year = yoe + era * 400 + i64::from(mp >= 10);
    i32::try_from(year).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::style::types::{Attribution, DataSource};

    fn catalog() -> StyleCatalog {
        StyleCatalog::default()
            .with_data_source(DataSource {
                id: "d1".into(),
                attribution: Some(Attribution::Os),
                spec: json!({"type": "vector", "url": "https://tiles/d1.json"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            })
            .with_data_source(DataSource {
                id: "unused".into(),
                attribution: None,
                spec: Map::new(),
            })
            .with_layer_source(LayerSource {
                id: "s1".into(),
                dependencies: vec!["d1".into()],
                glyphs: None,
                sprite: Some("https://sprites/s1".into()),
                layer_specs: vec![RenderLayer::new("l", "fill").with_paint("fill-opacity", json!(1))],
            })
            .with_layer_source(LayerSource {
                id: "s2".into(),
                dependencies: vec!["d1".into()],
                glyphs: Some("https://glyphs/{fontstack}/{range}.pbf".into()),
                sprite: Some("https://sprites/s2".into()),
                layer_specs: vec![
                    RenderLayer::new("dots", "circle").with_paint("circle-opacity", json!(0.8)),
                    RenderLayer::new("labels", "symbol").with("layout", json!({"text-field": "x"})),
                ],
            })
    }

    #[test]
    fn test_single_layer_half_opacity() {
        let style = compute_full_style(&catalog(), &[Layer::new("s1", 0.5)]).unwrap();

        assert_eq!(style.layers.len(), 1);
        assert_eq!(style.layers[0].id, "s1-l");
        assert_eq!(style.layers[0].paint["fill-opacity"], json!(0.5));
        assert_eq!(style.sources.len(), 1);
        assert!(style.sources.contains_key("d1"));
        assert_eq!(style.sprite.as_deref(), Some("https://sprites/s1"));
        assert_eq!(style.glyphs, None);
    }

    #[test]
    fn test_idempotent() {
        let layers = [Layer::new("s1", 0.3), Layer::new("s2", 1.0)];
        let a = compute_full_style(&catalog(), &layers).unwrap();
        let b = compute_full_style(&catalog(), &layers).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_value(&a).unwrap(),
            serde_json::to_value(&b).unwrap()
        );
    }

    #[test]
    fn test_opacity_scaling_rules() {
        let style = compute_full_style(&catalog(), &[Layer::new("s2", 0.5)]).unwrap();
        let dots = &style.layers[0];
        assert_eq!(dots.paint["circle-opacity"], json!(0.4));
        // Unset base counts as 1
        assert_eq!(dots.paint["circle-stroke-opacity"], json!(0.5));
        // Symbol layers are exempt
        assert!(style.layers[1].paint.is_empty());
        assert_eq!(style.glyphs.as_deref(), Some("https://glyphs/{fontstack}/{range}.pbf"));
    }

    #[test]
    fn test_near_opaque_layers_untouched() {
        let style = compute_full_style(&catalog(), &[Layer::new("s2", 0.96)]).unwrap();
        assert_eq!(style.layers[0].paint["circle-opacity"], json!(0.8));
        assert!(!style.layers[0].paint.contains_key("circle-stroke-opacity"));
    }

    #[test]
    fn test_zero_opacity_scales_to_zero() {
        let style = compute_full_style(&catalog(), &[Layer::new("s1", 0.0)]).unwrap();
        assert_eq!(style.layers[0].paint["fill-opacity"], json!(0.0));
    }

    #[test]
    fn test_namespaces_keep_shared_sources_apart() {
        let mut a = Layer::new("s1", 1.0);
        a.id = Some("base".into());
        let mut b = Layer::new("s1", 1.0);
        b.id = Some("overlay".into());

        let style = compute_full_style(&catalog(), &[a, b]).unwrap();
        let ids: Vec<_> = style.layers.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["base-l", "overlay-l"]);
        assert_eq!(style.sources.len(), 1);
    }

    #[test]
    fn test_expression_opacity_is_wrapped() {
        let expr = json!(["get", "opacity"]);
        assert_eq!(scale_opacity(Some(&expr), 0.5), json!(["*", ["get", "opacity"], 0.5]));
    }

    #[test]
    fn test_attribution_resolved() {
        let style = compute_full_style_in(&catalog(), &[Layer::new("s1", 1.0)], 2024).unwrap();
        assert_eq!(
            style.sources["d1"]["attribution"],
            "Contains OS data &copy; Crown copyright and database rights 2024"
        );
    }

    #[test]
    fn test_unknown_sources() {
        assert_eq!(
            compute_full_style(&catalog(), &[Layer::new("nope", 1.0)]).unwrap_err(),
            StyleError::UnknownLayerSource("nope".into())
        );

        let broken = catalog().with_layer_source(LayerSource {
            id: "s3".into(),
            dependencies: vec!["missing".into()],
            glyphs: None,
            sprite: None,
            layer_specs: vec![],
        });
        assert_eq!(
            compute_full_style(&broken, &[Layer::new("s3", 1.0)]).unwrap_err(),
            StyleError::UnknownDataSource("missing".into())
        );
    }

    #[test]
    fn test_year_of_day() {
        assert_eq!(year_of_day(0), 1970);
        assert_eq!(year_of_day(365), 1971);
        // 2024-12-31 and 2025-01-01
        assert_eq!(year_of_day(20_088), 2024);
        assert_eq!(year_of_day(20_089), 2025);
    }
}
