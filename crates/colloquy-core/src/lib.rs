pub mod config;
pub mod constants;
pub mod content;
pub mod error;
pub mod events;
pub mod models;
pub mod render;
pub mod runtime;
pub mod store;
pub mod streaming;
pub mod sync;
pub mod tracing_setup;
pub mod transport;

pub use config::{CoreConfig, GlobalSettings, SharedSettings};
pub use error::{CoreError, Result};
pub use events::CoreEvent;
pub use models::{ActiveSelection, DeliveryContext, HistoryKey, Message, MessageContent, Owner, Role};
pub use runtime::CoreRuntime;
pub use streaming::{StreamManager, StreamPhase};
pub use sync::{HistoryReconciler, SyncReport};
