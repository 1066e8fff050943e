//! telehand core — connection lifecycle supervisor.
//!
//! Brings two machines onto one virtual IPv4 subnet by supervising an
//! EasyTier overlay process:
//! - peer pool normalization and latency ranking
//! - deterministic subnet candidate planning with conflict filtering
//! - overlay process supervision and CLI snapshotting
//! - snapshot polling, diffing, and readiness classification
//! - the connect state machine with peer-then-subnet fallback
//! - the running guard with reconnect requests

pub mod config;
pub mod error;
pub mod guard;
pub mod overlay;
pub mod peer_pool;
pub mod plan;
pub mod platform;
pub mod poller;
pub mod readiness;
pub mod selector;
pub mod session;
pub mod status;
pub mod timing;

pub use config::{
    build_config_from_inputs, build_encoded_config_with_defaults, decode_config,
    decode_config_with_validation, mask_secret, network_owner_from_name, sanitize_sensitive_log,
    SessionConfig,
};
pub use error::{
    classify_error, format_connect_error, CoreError, CoreResult, ErrorCode, EXIT_CODE_NETWORK,
    EXIT_CODE_OK, EXIT_CODE_PARAM, EXIT_CODE_SERVICE,
};
pub use guard::{run_running_guard, RunningGuardConfig, RECONNECT_REASON_DEGRADED};
pub use overlay::{EasyTier, LogSink, OverlayBundle, StartOptions};
pub use plan::{compute_network_hash, Ipv4Candidate, Role, SessionBaseline};
pub use poller::{Event, EventKind, StatePoller};
pub use readiness::{PeerClass, PeerReadiness, Snapshot};
pub use selector::{rank_peers_by_latency, PeerProbeResult, PeerSelection};
pub use session::{
    connect_with_peer_fallback, CandidateCheckConfig, ConnectFailure, ConnectRoundResult,
    DecisionLogLimiter, SessionDeps,
};
pub use status::{
    peer_info_snapshot, CmdLog, InstallCommand, PeerInfoSnapshot, Phase, SharedStatus, StatusState,
    SubmitError,
};
