
pub mod file;
pub mod git;
pub mod memory;
pub mod todoist;

pub use file::FileBackend;
pub use git::GitBackend;
pub use memory::{MemoryBackend, RemoteCall};
pub use todoist::TodoistBackend;
