mod client;
mod entry;
mod group;
mod metadata;

pub use self::client::ClientDecl;
pub use self::entry::{AbstractEntry, LiteralEntry};
pub use self::group::{Conditional, GroupAssign, GroupDef, Predicate};
pub use self::metadata::ClientMetadata;
