pub mod context;
pub mod message;

pub use context::{ActiveSelection, DeliveryContext, HistoryKey, Owner};
pub use message::{Attachment, Message, MessageContent, Role};
