pub mod config;
pub mod domain;
pub mod errors;
pub mod external;
pub mod health;
pub mod logger;
pub mod notifier;
pub mod persistence;
pub mod registry;
pub mod rng;
pub mod rotation;
pub mod scheduler;
pub mod session;
pub mod supervisor;
pub mod verification;

pub use config::Config;
pub use domain::{ChannelId, ChannelMeta, MobileId, PendingVerification, PromotionResult, SessionState};
pub use errors::{CoreError, PermanentFailure, SendError, TransportError};
pub use external::{AccountStore, ChannelStore, Notifier, RemoteClient, TemplateStore};
pub use health::HealthChecker;
pub use logger::setup_logging;
pub use notifier::WebhookNotifier;
pub use persistence::StatePersistence;
pub use registry::ClientRegistry;
pub use rotation::RotationEngine;
pub use scheduler::PromotionScheduler;
pub use session::SessionStore;
pub use supervisor::{Supervisor, SupervisorStatus};
pub use verification::VerificationQueue;
