//! `topomap style`: print the full style of a scene.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::style::{Scene, compute_full_style};

/// Read a JSON scene file.
pub fn load_scene(path: &Path) -> Result<Scene> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid scene in {}", path.display()))
}

/// Full style of `scene` as pretty JSON.
pub fn render_style(scene: &Scene) -> Result<String> {
    let style = compute_full_style(&scene.catalog, &scene.layers)?;
    Ok(serde_json::to_string_pretty(&style)?)
}

pub fn print_style(path: &Path) -> Result<()> {
    let scene = load_scene(path)?;
    println!("{}", render_style(&scene)?);
    Ok(())
}
