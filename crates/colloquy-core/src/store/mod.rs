pub mod history;
pub mod json;
pub mod memory;
pub mod view;

pub use history::{without_thinking, HistoryStore};
pub use json::JsonHistoryStore;
pub use memory::MemoryHistoryStore;
pub use view::ActiveView;
