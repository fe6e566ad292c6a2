mod loader;
mod snapshot;
mod watcher;

pub use self::loader::{clients_document, load_snapshot, write_atomic};
pub use self::snapshot::{GroupGraph, RepoSnapshot};
pub use self::watcher::watch_repository;
