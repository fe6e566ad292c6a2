use std::collections::BTreeSet;
use std::net::IpAddr;

use super::group::GroupAssign;

/// A client record, either declared in `Metadata/clients.xml` or created
/// by dynamic registration under the default profile.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientDecl {
    pub name: String,
    pub profile: Option<String>,
    pub aliases: BTreeSet<String>,
    pub addresses: BTreeSet<IpAddr>,
    pub uuid: Option<String>,
    pub password: Option<String>,
    /// Only the per-client password is accepted.
    pub secure: bool,
    /// May connect from addresses other than the declared ones.
    pub floating: bool,
    pub declared_groups: Vec<GroupAssign>,
    pub version: Option<String>,
}

impl ClientDecl {
    pub fn new(name: impl Into<String>) -> Self {
        ClientDecl {
            name: name.into(),
            floating: true,
            ..ClientDecl::default()
        }
    }

    pub fn known_address(&self, addr: &IpAddr) -> bool {
        self.addresses.contains(addr)
    }
}
