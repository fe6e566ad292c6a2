/// A group declaration from the metadata repository.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupDef {
    pub name: String,
    pub profile: bool,
    pub public: bool,
    pub default: bool,
    pub category: Option<String>,
    /// Bundles contributed when this group is active, in declared order.
    pub bundles: Vec<String>,
    /// Unconditional group inclusions, in declared order.
    pub includes: Vec<String>,
}

/// A group reference that either grants or (negated) revokes membership.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupAssign {
    pub name: String,
    pub negate: bool,
}

impl GroupAssign {
    pub fn member(name: impl Into<String>) -> Self {
        GroupAssign {
            name: name.into(),
            negate: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Predicate {
    /// Fires iff the named group is active, XOR negated.
    Group { name: String, negate: bool },
    /// Fires iff the client's canonical name matches, XOR negated.
    Client { name: String, negate: bool },
}

/// A `<Group>`/`<Client>` element with children: its body applies only
/// when the predicate holds for the client under resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conditional {
    pub predicate: Predicate,
    pub groups: Vec<GroupAssign>,
    pub bundles: Vec<String>,
    pub nested: Vec<Conditional>,
}
