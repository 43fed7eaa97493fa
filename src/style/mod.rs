//! Map style computation and incremental render updates.
//!
//! ```text
//!   catalog + layers ──► compute ──► Style            (full rebuild)
//!   prev/next layers ──► update  ──► PaintCall*       (opacity only)
//!   prev/next render ──► diff    ──► RenderOp*        (structural)
//!                                        │
//!                          render::MapRenderer ──► RenderEngine
//! ```
//!
//! Everything except `render` is pure.

pub mod compute;
pub mod diff;
pub mod render;
pub mod types;
pub mod update;

use thiserror::Error;

pub use compute::{compute_full_style, OPACITY_CUTOFF};
pub use diff::{RenderOp, diff_render_layers};
pub use render::{FrameSlot, MapRenderer, RenderEngine};
pub use types::{DataSource, Layer, LayerSource, RenderLayer, Scene, Style, StyleCatalog};
pub use update::{PaintCall, StyleUpdate, plan_update};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StyleError {
    #[error("layer source `{0}` is not in the catalog")]
    UnknownLayerSource(String),

    #[error("data source `{0}` is not in the catalog")]
    UnknownDataSource(String),

    #[error("unsupported change to render layer `{layer}`: {reason}")]
    UnsupportedDelta { layer: String, reason: String },

    #[error("render layer `{0}` does not exist")]
    MissingRenderLayer(String),
}
