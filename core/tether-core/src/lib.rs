//! # tether-core
//!
//! Session-synchronization engine for the tether chat client: keeps one
//! WebSocket to the backend alive across network drops and app
//! backgrounding, correlates requests with responses, resubscribes tracked
//! sessions after every reconnect, rebuilds streamed replies into complete
//! messages, and persists per-project history with corruption recovery.
//!
//! ## Design Principles
//!
//! - **Single writer**: one actor task owns all connection state; [`Engine`]
//!   is a handle that sends it commands.
//! - **Pure state machines**: backoff, heartbeat, lifecycle, correlation and
//!   reconstruction are plain structs driven by the actor and tested without
//!   sockets.
//! - **Graceful degradation**: corrupt files are quarantined and read as
//!   empty; malformed frames are dropped. Nothing here panics.
//! - **Explicit injection**: storage root and configuration are passed in,
//!   never read from globals inside the engine.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tether_core::{ConnectTarget, Engine, EngineConfig, ProjectDescriptor, StorageConfig};
//!
//! let engine = Engine::new(EngineConfig::default(), StorageConfig::default());
//! engine.connect_to(ConnectTarget { endpoint: "ws://127.0.0.1:3001/ws".into(), auth_token: None })?;
//! let project = ProjectDescriptor::from_path("/Users/pete/Code/app");
//! let receipt = engine.send_chat(&project, None, "run the tests").await?;
//! ```

pub mod config;
pub mod correlator;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod http;
pub mod lifecycle;
pub mod persistence;
pub mod push;
pub mod reconstructor;
pub mod reliability;
pub mod storage;
pub mod tracker;
pub mod transport;
pub mod types;

pub use config::{
    load_engine_config, save_engine_config, BackgroundFetchConfig, BackoffPolicy, EngineConfig,
    HeartbeatConfig, LifecycleConfig,
};
pub use correlator::{PendingReply, RequestCorrelator};
pub use engine::{ChatReceipt, Engine};
pub use error::{Result, SyncError};
pub use http::{health_url, probe_health, HealthStatus};
pub use lifecycle::AppTransition;
pub use persistence::PersistenceStore;
pub use push::{BackgroundFetcher, PushOutcome};
pub use reconstructor::{ReconstructionUpdate, StreamReconstructor};
pub use storage::StorageConfig;
pub use transport::{ConnectTarget, TransportEvent};
pub use types::*;
