//! Application state and its serialized store.
//!
//! ```text
//!   Action ──► Store::dispatch ──► reduce(prev) ──► next
//!                    │                               │
//!                    └──── Transition{prev, next} ◄──┘
//!                               │
//!                  ┌────────────┴────────────┐
//!             SyncEngine (publish)     MapRenderer (frame slot)
//! ```
//!
//! `AppState` is an immutable snapshot. Every field that can be large sits
//! behind an `Arc`, so cloning a snapshot to build the next one is cheap and
//! unchanged parts keep their identity.

mod reduce;
mod store;

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::feature::{At, Direction, FeatureError, FeatureKind, FeatureStore, FeatureUpdate};
use crate::style::{Layer, StyleCatalog};
use crate::sync::presence::PresenceState;
use crate::sync::projection::SyncPatch;
use crate::sync::transport::ConnectionStatus;

pub use reduce::reduce;
pub use store::{Origin, Store, SubscriptionId, Transition};

/// The replicated part of the state.
#[derive(Debug, Clone, Default)]
pub struct SyncData {
    pub features: FeatureStore,
    pub layers: Arc<Vec<Layer>>,
}

/// A feature waiting for its position to be picked on the map.
#[derive(Debug, Clone, PartialEq)]
pub struct Creating {
    pub kind: FeatureKind,
    pub at: At,
}

/// Peers' presence, keyed by their awareness client id.
pub type Peers = BTreeMap<u64, PresenceState>;

#[derive(Debug, Clone, Default)]
pub struct AppState {
    pub sync: SyncData,
    pub active: Option<String>,
    pub creating: Option<Creating>,
    pub status: ConnectionStatus,
    pub peers: Arc<Peers>,
    pub catalog: Arc<StyleCatalog>,
    /// Registered sprite images, id to image URL.
    pub sprites: Arc<BTreeMap<String, String>>,
}

impl AppState {
    pub fn new(catalog: StyleCatalog, layers: Vec<Layer>) -> Self {
        Self {
            sync: SyncData {
                features: FeatureStore::new(),
                layers: Arc::new(layers),
            },
            catalog: Arc::new(catalog),
            ..Self::default()
        }
    }

    pub fn features(&self) -> &FeatureStore {
        &self.sync.features
    }

    /// Local presence, as broadcast to peers.
    pub fn presence(&self) -> PresenceState {
        PresenceState {
            active_feature: self.active.clone(),
        }
    }

    /// Peers whose selection is `feature_id`.
    pub fn peers_active_on(&self, feature_id: &str) -> Vec<u64> {
        self.peers
            .iter()
            .filter(|(_, peer)| peer.active_feature.as_deref() == Some(feature_id))
            .map(|(client, _)| *client)
            .collect()
    }
}

// =============================================================================
// Actions
// =============================================================================

#[derive(Debug, Clone)]
pub enum Action {
    SetActive(Option<String>),
    /// Start placing a new feature of `kind` after the active one.
    EnterLatlngPicker(FeatureKind),
    CancelCreating,
    CreateGroup {
        id: String,
    },
    CreatePoint {
        id: String,
        at: At,
        lng_lat: [f64; 2],
    },
    UpdateFeature {
        id: String,
        update: FeatureUpdate,
    },
    DeleteFeature {
        id: String,
    },
    RestoreFeature {
        id: String,
    },
    MoveActive(Direction),
    AddLayer(Layer),
    RemoveLayer {
        index: usize,
    },
    MoveLayer {
        from: usize,
        to: usize,
    },
    SetLayerOpacity {
        index: usize,
        opacity: f64,
    },
    AddSprites(Vec<(String, String)>),
    /// Absorbed change from the replicated document.
    RemoteUpdate(SyncPatch),
    /// Full presence of every peer.
    RemoteAwareUpdate(Peers),
    WsReportStatus(ConnectionStatus),
}

impl Action {
    /// Create a group with a fresh id.
    pub fn create_group() -> Self {
        Self::CreateGroup { id: new_id() }
    }

    /// Create a point with a fresh id at a picked position.
    pub fn create_point(at: At, lng_lat: [f64; 2]) -> Self {
        Self::CreatePoint {
            id: new_id(),
            at,
            lng_lat,
        }
    }

    pub fn origin(&self) -> Origin {
        match self {
            Self::RemoteUpdate(_) | Self::RemoteAwareUpdate(_) | Self::WsReportStatus(_) => {
                Origin::Remote
            }
            _ => Origin::Local,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetActive(_) => "setActive",
            Self::EnterLatlngPicker(_) => "enterLatlngPicker",
            Self::CancelCreating => "cancelCreating",
            Self::CreateGroup { .. } => "createGroup",
            Self::CreatePoint { .. } => "createPoint",
            Self::UpdateFeature { .. } => "updateFeature",
            Self::DeleteFeature { .. } => "deleteFeature",
            Self::RestoreFeature { .. } => "restoreFeature",
            Self::MoveActive(_) => "moveActive",
            Self::AddLayer(_) => "addLayer",
            Self::RemoveLayer { .. } => "removeLayer",
            Self::MoveLayer { .. } => "moveLayer",
            Self::SetLayerOpacity { .. } => "setLayerOpacity",
            Self::AddSprites(_) => "addSprites",
            Self::RemoteUpdate(_) => "remoteUpdate",
            Self::RemoteAwareUpdate(_) => "remoteAwareUpdate",
            Self::WsReportStatus(_) => "wsReportStatus",
        }
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StateError {
    #[error(transparent)]
    Feature(#[from] FeatureError),

    #[error("feature id `{0}` is already taken")]
    DuplicateId(String),

    #[error("no layer at index {0}")]
    LayerIndex(usize),

    #[error("layer opacity must be a finite number, got {0}")]
    InvalidOpacity(f64),
}
