use serde::{Deserialize, Serialize};

/// Rolling per-window capture state used by the status detector to compute
/// the change-detection ratio between successive polls (§4.3).
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PaneCacheState {
    pub last_capture: String,
    pub last_capture_dims: Option<(u16, u16)>,
    pub last_changed_at: Option<String>,
    pub grace_started_at: Option<String>,
}
