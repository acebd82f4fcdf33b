//! provision: resumable, checkpointed provisioning of the k1 GitOps platform.
//! Talks to the outside world only through the capability traits in `adapters`.

pub mod adapters;
pub mod checkpoint;
pub mod config;
pub mod credentials;
pub mod error;
pub mod progress;
pub mod reconciler;
pub mod registry;
pub mod reporter;
pub mod request;
pub mod resolver;
pub mod retry;
pub mod runner;
pub mod stage;
pub mod stages;
pub mod telemetry;
pub mod template;
pub mod workdir;

/// Version stamped into rendered templates and the default template branch.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use adapters::Capabilities;
pub use checkpoint::{Checkpoint, CheckpointStore, INSTALL_COMPLETE_MARKER};
pub use config::K1Config;
pub use credentials::{collect_root_credentials, RootCredential, RootCredentials};
pub use error::{exit_codes, AdapterError, AdapterErrorKind, ErrorCategory, ProvisionError, ValidationError};
pub use progress::{EventEmitter, EventKind, ProgressEvent};
pub use reconciler::{Check, ClusterSnapshot, ClusterStatus, ControlPlane, Reconciler, ReconcilerSettings};
pub use registry::StageRegistry;
pub use request::{CloudProvider, GitProvider, InstallRequest};
pub use resolver::{EnvSource, FlagResolver, FlagValues, ProcessEnv};
pub use runner::{reset, Runner};
pub use stage::{Stage, StageId};
pub use workdir::WorkDir;
