mod expansion;
mod identity;
mod resolver;

pub use self::expansion::{Expansion, expand};
pub use self::identity::{
    DnsReverseResolver, Identity, NoReverseResolver, ResolvedIdentity, ReverseResolver,
    authenticate, resolve_client,
};
pub use self::resolver::build_metadata;
