use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::CoreError;
use crate::model::ClientDecl;
use crate::options::ServerOptions;

/// What the transport layer knows about a request.
#[derive(Clone, Debug)]
pub struct Identity {
    /// Name the client claims (HTTP auth user).
    pub claimed: Option<String>,
    pub peer: IpAddr,
    /// CN of a verified client certificate, when TLS termination
    /// forwarded one.
    pub cert_cn: Option<String>,
    pub password: Option<String>,
}

/// Reverse-DNS seam. The server binary installs the real resolver; the
/// rest of the crate (and the tests) only see the trait.
pub trait ReverseResolver: Send + Sync {
    fn reverse(&self, addr: IpAddr) -> Option<String>;
}

/// Blocking reverse lookup under a timeout; expiry is treated as
/// unresolved rather than an error.
pub struct DnsReverseResolver {
    timeout: Duration,
}

impl DnsReverseResolver {
    pub fn new(timeout: Duration) -> Self {
        DnsReverseResolver { timeout }
    }
}

impl ReverseResolver for DnsReverseResolver {
    fn reverse(&self, addr: IpAddr) -> Option<String> {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(dns_lookup::lookup_addr(&addr).ok());
        });
        match rx.recv_timeout(self.timeout) {
            Ok(resolved) => resolved,
            Err(_) => {
                tracing::debug!(%addr, "reverse DNS lookup timed out");
                None
            }
        }
    }
}

pub struct NoReverseResolver;

impl ReverseResolver for NoReverseResolver {
    fn reverse(&self, _addr: IpAddr) -> Option<String> {
        None
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolvedIdentity {
    /// An already-known client.
    Known(String),
    /// No record matched; dynamic registration under the default
    /// profile may create this client.
    Dynamic(String),
}

/// First-match identity resolution: certificate CN, claimed UUID,
/// reverse DNS against names and aliases, peer address, then dynamic
/// registration when a default profile exists.
pub fn resolve_client(
    clients: &BTreeMap<String, ClientDecl>,
    has_default_profile: bool,
    identity: &Identity,
    resolver: &dyn ReverseResolver,
) -> Result<ResolvedIdentity, CoreError> {
    if let Some(cn) = &identity.cert_cn {
        for decl in clients.values() {
            if &decl.name == cn || decl.uuid.as_deref() == Some(cn) {
                return Ok(ResolvedIdentity::Known(decl.name.clone()));
            }
        }
    }

    if let Some(claimed) = &identity.claimed {
        for decl in clients.values() {
            if decl.uuid.as_deref() == Some(claimed) {
                return Ok(ResolvedIdentity::Known(decl.name.clone()));
            }
        }
    }

    let canonical = resolver.reverse(identity.peer);
    if let Some(canonical) = &canonical {
        let short = canonical.split('.').next().unwrap_or(canonical);
        for decl in clients.values() {
            if decl.name == *canonical || decl.name == short {
                return Ok(ResolvedIdentity::Known(decl.name.clone()));
            }
        }
        for decl in clients.values() {
            if decl.aliases.contains(canonical) || decl.aliases.contains(short) {
                return Ok(ResolvedIdentity::Known(decl.name.clone()));
            }
        }
    }

    for decl in clients.values() {
        if decl.known_address(&identity.peer) {
            return Ok(ResolvedIdentity::Known(decl.name.clone()));
        }
    }

    if has_default_profile {
        let name = identity
            .claimed
            .clone()
            .or(canonical)
            .ok_or_else(|| {
                CoreError::MetadataConsistency(format!(
                    "cannot name unregistered client at {}",
                    identity.peer
                ))
            })?;
        return Ok(ResolvedIdentity::Dynamic(name));
    }

    Err(CoreError::MetadataConsistency(format!(
        "no client record matches {} and no default profile exists",
        identity.peer
    )))
}

/// Password and address binding. `secure` clients accept only their
/// own password; a verified certificate CN matching the client skips
/// the password check and lifts the address restriction.
pub fn authenticate(
    options: &ServerOptions,
    decl: &ClientDecl,
    identity: &Identity,
) -> Result<(), CoreError> {
    if let Some(cn) = &identity.cert_cn {
        if cn == &decl.name || decl.uuid.as_deref() == Some(cn) {
            return Ok(());
        }
        return Err(CoreError::MetadataAuth(format!(
            "certificate CN {cn} does not match client {}",
            decl.name
        )));
    }

    let password = identity
        .password
        .as_deref()
        .ok_or_else(|| CoreError::MetadataAuth(format!("no password for client {}", decl.name)))?;

    let per_client = decl.password.as_deref() == Some(password);
    let global = options.password.as_deref() == Some(password);
    let accepted = if decl.secure { per_client } else { per_client || global };
    if !accepted {
        return Err(CoreError::MetadataAuth(format!(
            "password rejected for client {}",
            decl.name
        )));
    }

    if !decl.floating && !decl.known_address(&identity.peer) {
        return Err(CoreError::MetadataAuth(format!(
            "client {} is not floating and {} is not a registered address",
            decl.name, identity.peer
        )));
    }

    Ok(())
}
