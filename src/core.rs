use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;

use crate::binder::{BindDiagnostics, BoundStructure, PluginRegistry, bind_structure};
use crate::error::CoreError;
use crate::metadata::{
    Identity, ResolvedIdentity, ReverseResolver, authenticate, build_metadata, resolve_client,
};
use crate::model::{ClientDecl, ClientMetadata};
use crate::options::{DecisionMode, ServerOptions};
use crate::probes::{ProbeConnector, ProbeStore, ProbesPlugin, probes_document};
use crate::repo::{RepoSnapshot, clients_document, load_snapshot, write_atomic};
use crate::session::SessionStore;
use crate::stats::{FlatLogSink, StatsIntake, parse_stats};
use crate::structures::BundlerSource;
use crate::xml::Element;

const AUTH_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Per-request deadline. Checked between entries during binding and
/// between bundles during assembly; expiry aborts the request with a
/// retryable error and no partial result.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    end: Option<Instant>,
}

impl Deadline {
    pub fn after_ms(ms: u64) -> Self {
        Deadline {
            end: Some(Instant::now() + Duration::from_millis(ms)),
        }
    }

    pub fn unbounded() -> Self {
        Deadline { end: None }
    }

    pub fn check(&self) -> Result<(), CoreError> {
        match self.end {
            Some(end) if Instant::now() >= end => Err(CoreError::MetadataRuntime(
                "request deadline exceeded".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// The configuration synthesis pipeline: identity -> metadata ->
/// structures -> literal entries -> decision filter -> document.
///
/// Owns the published repository snapshot and every piece of mutable
/// server state (metadata memo, probe cache, sessions, statistics
/// queue).
pub struct Core {
    options: ServerOptions,
    registry: PluginRegistry,
    snapshot: ArcSwap<RepoSnapshot>,
    generation: AtomicU64,
    degraded: AtomicBool,
    metadata_cache: Mutex<HashMap<String, Arc<ClientMetadata>>>,
    dynamic_clients: Mutex<BTreeMap<String, ClientDecl>>,
    sessions: SessionStore,
    stats: Arc<StatsIntake>,
    probe_store: Arc<ProbeStore>,
    diags: BindDiagnostics,
    reverse: Arc<dyn ReverseResolver>,
    auth_log: Mutex<HashMap<String, Instant>>,
}

impl Core {
    pub fn new(options: ServerOptions, reverse: Arc<dyn ReverseResolver>) -> Result<Self, CoreError> {
        Self::new_with(options, reverse, |_| {})
    }

    /// Construct with extra plugins registered on top of the built-in
    /// set (Rules, Bundler, Probes, optional flat-log sink).
    pub fn new_with(
        options: ServerOptions,
        reverse: Arc<dyn ReverseResolver>,
        configure: impl FnOnce(&mut PluginRegistry),
    ) -> Result<Self, CoreError> {
        let snapshot = load_snapshot(&options, 1)?;

        let probe_store = Arc::new(ProbeStore::default());
        let mut registry = PluginRegistry::new();
        registry.register_generator(Arc::new(crate::binder::rules::RulesGenerator));
        registry.register_structure_source(Arc::new(BundlerSource::new()));
        registry.register_probe_producer(Arc::new(ProbesPlugin::new(probe_store.clone())));
        registry.register_connector(Arc::new(ProbeConnector::new(probe_store.clone())));
        if let Some(path) = &options.stats_log {
            registry.register_statistics_sink(Arc::new(FlatLogSink::new(path.clone())));
        }
        configure(&mut registry);

        let stats = Arc::new(StatsIntake::new(options.stats_queue));

        Ok(Core {
            options,
            registry,
            snapshot: ArcSwap::from_pointee(snapshot),
            generation: AtomicU64::new(1),
            degraded: AtomicBool::new(false),
            metadata_cache: Mutex::new(HashMap::new()),
            dynamic_clients: Mutex::new(BTreeMap::new()),
            sessions: SessionStore::default(),
            stats,
            probe_store,
            diags: BindDiagnostics::default(),
            reverse,
            auth_log: Mutex::new(HashMap::new()),
        })
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn stats(&self) -> Arc<StatsIntake> {
        self.stats.clone()
    }

    pub fn snapshot(&self) -> Arc<RepoSnapshot> {
        self.snapshot.load_full()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Rebuild the snapshot off-line and publish it atomically. On
    /// failure the previous snapshot keeps serving and the server is
    /// marked degraded.
    pub fn reload(&self) {
        let generation = self.generation.load(Ordering::Relaxed) + 1;
        match load_snapshot(&self.options, generation) {
            Ok(snapshot) => {
                self.snapshot.store(Arc::new(snapshot));
                self.generation.store(generation, Ordering::Relaxed);
                self.degraded.store(false, Ordering::Relaxed);
                self.metadata_cache.lock().expect("metadata cache lock").clear();
                self.dynamic_clients.lock().expect("dynamic clients lock").clear();
                self.diags.clear();
                tracing::info!(generation, "repository snapshot published");
            }
            Err(err) => {
                self.degraded.store(true, Ordering::Relaxed);
                tracing::warn!(error = %err, "repository degraded; keeping previous snapshot");
            }
        }
    }

    fn clients_view(&self, snap: &RepoSnapshot) -> BTreeMap<String, ClientDecl> {
        let mut view = snap.clients.clone();
        for (name, decl) in self.dynamic_clients.lock().expect("dynamic clients lock").iter() {
            view.insert(name.clone(), decl.clone());
        }
        view
    }

    fn log_auth_failure(&self, who: &str, err: &CoreError) {
        let mut log = self.auth_log.lock().expect("auth log lock");
        let now = Instant::now();
        let due = log
            .get(who)
            .is_none_or(|last| now.duration_since(*last) >= AUTH_LOG_INTERVAL);
        if due {
            log.insert(who.to_string(), now);
            tracing::warn!(client = who, error = %err, "authentication failure");
        }
    }

    /// Resolve the request's identity to a client record, enforcing the
    /// authentication binding. Unknown clients register dynamically when
    /// a default profile exists.
    fn resolve_and_auth(
        &self,
        identity: &Identity,
    ) -> Result<(Arc<RepoSnapshot>, ClientDecl), CoreError> {
        let snap = self.snapshot();
        let view = self.clients_view(&snap);
        let has_default = snap.groups.default_profile().is_some();

        let resolved = resolve_client(&view, has_default, identity, self.reverse.as_ref())?;
        let name = match &resolved {
            ResolvedIdentity::Known(name) => name.clone(),
            ResolvedIdentity::Dynamic(name) => name.clone(),
        };

        if let Some(decl) = view.get(&name) {
            if let Err(err) = authenticate(&self.options, decl, identity) {
                self.log_auth_failure(&name, &err);
                return Err(err);
            }
            return Ok((snap, decl.clone()));
        }

        // Dynamic registration: bind the new client to the default
        // profile and remember the address it arrived from.
        let mut decl = ClientDecl::new(name.clone());
        decl.profile = snap.groups.default_profile().map(|g| g.name.clone());
        decl.addresses.insert(identity.peer);
        if let Err(err) = authenticate(&self.options, &decl, identity) {
            self.log_auth_failure(&name, &err);
            return Err(err);
        }

        tracing::info!(client = %name, peer = %identity.peer, "registered new client");
        self.dynamic_clients
            .lock()
            .expect("dynamic clients lock")
            .insert(name.clone(), decl.clone());
        self.persist_clients(&snap)?;
        self.invalidate_metadata(&name);

        Ok((snap, decl))
    }

    fn metadata_for(
        &self,
        snap: &RepoSnapshot,
        decl: &ClientDecl,
    ) -> Result<Arc<ClientMetadata>, CoreError> {
        if let Some(cached) = self
            .metadata_cache
            .lock()
            .expect("metadata cache lock")
            .get(&decl.name)
        {
            return Ok(cached.clone());
        }

        let mut probe_groups: BTreeSet<String> = BTreeSet::new();
        let mut connectors: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        for connector in self.registry.connectors() {
            probe_groups.extend(connector.groups(&decl.name));
            for (key, value) in connector.data(&decl.name) {
                connectors.insert(key, value);
            }
        }

        let metadata = Arc::new(build_metadata(snap, decl, &probe_groups, connectors)?);
        self.metadata_cache
            .lock()
            .expect("metadata cache lock")
            .insert(decl.name.clone(), metadata.clone());
        Ok(metadata)
    }

    fn invalidate_metadata(&self, client: &str) {
        self.metadata_cache
            .lock()
            .expect("metadata cache lock")
            .remove(client);
    }

    fn persist_clients(&self, snap: &RepoSnapshot) -> Result<(), CoreError> {
        let view = self.clients_view(snap);
        let doc = clients_document(&view);
        let path = self.options.repository.join("Metadata/clients.xml");
        write_atomic(&path, doc.to_xml().as_bytes())
    }

    fn update_client(
        &self,
        snap: &RepoSnapshot,
        decl: &ClientDecl,
        mutate: impl FnOnce(&mut ClientDecl),
    ) -> Result<(), CoreError> {
        let mut updated = decl.clone();
        mutate(&mut updated);
        self.dynamic_clients
            .lock()
            .expect("dynamic clients lock")
            .insert(updated.name.clone(), updated);
        self.persist_clients(snap)?;
        self.invalidate_metadata(&decl.name);
        Ok(())
    }

    // ---- RPC surface -------------------------------------------------

    pub fn assert_profile(&self, identity: &Identity, profile: &str) -> Result<bool, CoreError> {
        let (snap, decl) = self.resolve_and_auth(identity)?;

        let group = snap.groups.get(profile).ok_or_else(|| {
            CoreError::MetadataConsistency(format!("unknown profile group {profile}"))
        })?;
        if !group.public {
            return Err(CoreError::MetadataConsistency(format!(
                "group {profile} is not public"
            )));
        }

        self.update_client(&snap, &decl, |c| c.profile = Some(profile.to_string()))?;
        self.sessions.profiled(&decl.name);
        Ok(true)
    }

    pub fn declare_version(&self, identity: &Identity, version: &str) -> Result<bool, CoreError> {
        let (snap, decl) = self.resolve_and_auth(identity)?;
        self.update_client(&snap, &decl, |c| c.version = Some(version.to_string()))?;
        Ok(true)
    }

    pub fn get_probes(&self, identity: &Identity) -> Result<String, CoreError> {
        let (snap, decl) = self.resolve_and_auth(identity)?;
        let metadata = self.metadata_for(&snap, &decl)?;

        let mut defs = Vec::new();
        for producer in self.registry.probe_producers() {
            defs.extend(producer.probes(&snap, &metadata));
        }

        self.sessions
            .probes_sent(&decl.name, defs.iter().map(|d| d.name.clone()));
        Ok(probes_document(&defs).to_xml())
    }

    pub fn recv_probe_data(&self, identity: &Identity, body: &str) -> Result<bool, CoreError> {
        let (_snap, decl) = self.resolve_and_auth(identity)?;

        let root = Element::parse(body)
            .map_err(|err| CoreError::MetadataRuntime(format!("bad probe data: {err:#}")))?;

        for response in root.find_all("probe-data") {
            let source = response.attr("source").unwrap_or("Probes");
            let producer = self
                .registry
                .probe_producers()
                .iter()
                .find(|p| p.name() == source);
            match producer {
                Some(producer) => {
                    if let Err(err) = producer.receive_data(&decl.name, response) {
                        tracing::warn!(
                            client = %decl.name,
                            source,
                            error = %err,
                            "probe ingestion failed; continuing"
                        );
                    }
                }
                None => {
                    tracing::warn!(client = %decl.name, source, "probe response for unknown plugin");
                }
            }
        }

        self.invalidate_metadata(&decl.name);
        self.sessions.probes_received(&decl.name);
        Ok(true)
    }

    pub fn get_config(&self, identity: &Identity) -> Result<String, CoreError> {
        let deadline = Deadline::after_ms(self.options.request_timeout_ms);
        let (snap, decl) = self.resolve_and_auth(identity)?;
        self.sessions.ensure_ready_for_config(&decl.name)?;
        let metadata = self.metadata_for(&snap, &decl)?;

        let document = match self.synthesize(&snap, &metadata, &deadline) {
            Ok(document) => document,
            Err(err @ CoreError::MetadataRuntime(_)) => return Err(err),
            Err(err) => {
                tracing::error!(client = %decl.name, error = %err, "configuration synthesis failed");
                Element::new("error").with_text(err.to_string())
            }
        };

        self.sessions.served(&decl.name);
        Ok(document.to_xml())
    }

    fn synthesize(
        &self,
        snap: &RepoSnapshot,
        metadata: &ClientMetadata,
        deadline: &Deadline,
    ) -> Result<Element, CoreError> {
        let mut document = Element::new("Configuration");

        for source in self.registry.structure_sources() {
            let structures = source.assemble(snap, metadata, deadline)?;
            for structure in &structures {
                deadline.check()?;
                let bound = bind_structure(
                    &self.registry,
                    snap,
                    metadata,
                    structure,
                    &self.diags,
                    deadline,
                )?;
                document
                    .children
                    .push(self.bundle_element(snap, metadata, bound));
            }
        }

        Ok(document)
    }

    fn bundle_element(
        &self,
        snap: &RepoSnapshot,
        metadata: &ClientMetadata,
        bound: BoundStructure,
    ) -> Element {
        let mut el = Element::new("Bundle").with_attr("name", bound.name.clone());
        if let Some(failure) = &bound.failure {
            el.children.push(failure.to_element());
            return el;
        }

        let filtered = snap
            .decisions
            .apply(self.options.decision, metadata, bound.entries);
        for entry in filtered {
            el.children.push(entry.to_element());
        }
        el
    }

    pub fn get_decision_list(
        &self,
        identity: &Identity,
        mode: &str,
    ) -> Result<Vec<(String, String)>, CoreError> {
        let mode = match mode {
            "whitelist" => DecisionMode::Whitelist,
            "blacklist" => DecisionMode::Blacklist,
            other => {
                return Err(CoreError::MetadataRuntime(format!(
                    "unknown decision mode {other:?}"
                )));
            }
        };

        let (snap, decl) = self.resolve_and_auth(identity)?;
        let metadata = self.metadata_for(&snap, &decl)?;
        Ok(snap.decisions.visible(mode, &metadata))
    }

    pub fn recv_stats(&self, identity: &Identity, body: &str) -> Result<bool, CoreError> {
        let (_snap, decl) = self.resolve_and_auth(identity)?;

        let root = Element::parse(body)
            .map_err(|err| CoreError::MetadataRuntime(format!("bad statistics: {err:#}")))?;
        let record = parse_stats(&decl.name, &root)?;
        self.stats.enqueue(record);
        Ok(true)
    }

    /// Forget everything volatile about a client (probe data, session,
    /// memoized metadata). Administrative hook.
    pub fn forget_client(&self, client: &str) {
        self.probe_store.forget(client);
        self.sessions.reset(client);
        self.invalidate_metadata(client);
    }
}
