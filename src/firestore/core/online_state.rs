use serde::{Deserialize, Serialize};

/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OnlineState {
    /// Not yet known; listeners behave as if online and wait for the server.
    #[default]
    Unknown,
    Online,
    /// Listeners raise events from cache without waiting for the server.
    Offline,
}

/// Component that reported an online state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnlineStateSource {
    RemoteStore,
    SharedClientState,
}
