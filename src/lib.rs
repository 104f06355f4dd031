pub mod channel;
pub mod client;
pub mod commons;
pub mod config;
pub mod controller;
pub mod draft;
pub mod errors;
pub mod journal;
pub mod models;
pub mod reconcile;
pub mod resolve;
pub mod session;
pub mod settings;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use channel::{ChannelClose, LiveChannel, TaskEvent};
pub use client::{ApiClient, CreateTaskRequest, SESSION_HEADER};
pub use commons::CommonsClient;
pub use config::AppConfig;
pub use controller::{
    ImportSession, RejectedDraft, SessionPhase, SubmitOutcome, WatchObserver, WatchUpdate,
};
pub use draft::ImportDraft;
pub use errors::{AppError, AppResult};
pub use journal::ActivityJournal;
pub use models::{OverwriteBehaviour, Task, TaskProcess, TaskSnapshot, TaskStatus, TaskType};
pub use reconcile::TaskObservation;
pub use resolve::{LinkOutcome, LinkResolver};
pub use session::{SessionStore, StoredSession};
pub use settings::ImportSettings;

/// Keychain service name sessions are stored under.
pub const SESSION_SERVICE_NAME: &str = "owid-importer";

/// Installs the global tracing subscriber. Later calls are no-ops, so both
/// the binary and tests can run through here.
pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,owid_importer=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
