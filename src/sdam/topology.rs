use std::{
    collections::HashMap,
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex as SyncMutex,
        MutexGuard as SyncMutexGuard,
        PoisonError,
        Weak,
    },
    time::{Duration, Instant},
};

use rand::{rngs::SmallRng, SeedableRng};
use tokio::sync::{broadcast, watch, Mutex, MutexGuard};

use super::{
    description::{
        server::{ServerDescription, ServerId, TopologyVersion},
        topology::{server_selection::SelectedServer, TopologyDescription, TopologyType},
    },
    monitor::Monitor,
    scanner::Scanner,
};
use crate::{
    bson::oid::ObjectId,
    cluster_time::ClusterTime,
    conn::{establish::ConnectionEstablisher, Connection},
    error::{Error, ErrorKind, Result},
    hello::HelloReply,
    options::{ClusterOptions, ServerAddress},
    runtime::{self, AsyncJoinHandle},
    selection_criteria::{OperationType, ReadPreference},
};

/// Servers at or below this wire version (MongoDB 4.0) close every connection when they step
/// down, so a state change error from them also clears the pool.
const CLEAR_POOL_ON_STATE_CHANGE_MAX_WIRE_VERSION: i32 = 7;

/// The authoritative view of a deployment, shared by every task that selects servers or reports
/// errors.
///
/// Readers take a cheap [`Arc`] snapshot of the current [`TopologyDescription`] and never block.
/// Writers go through [`Topology::modify`], which serializes all modifications behind a single
/// lock and publishes the result as a new snapshot on commit.
///
/// Cloning a `Topology` yields another handle to the same state.
#[derive(Clone)]
pub struct Topology {
    inner: Arc<TopologyInner>,
}

struct TopologyInner {
    options: ClusterOptions,

    /// Publishes snapshots and wakes tasks blocked in server selection.
    publisher: watch::Sender<Arc<TopologyDescription>>,

    modification_lock: Mutex<()>,

    rng: SyncMutex<SmallRng>,

    update_requester: UpdateRequester,

    /// One heartbeat task per monitored server. Empty in single-threaded and load balanced mode.
    monitors: SyncMutex<HashMap<ServerId, AsyncJoinHandle<()>>>,

    establisher: ConnectionEstablisher,

    /// Present only in single-threaded mode.
    scanner: Option<Mutex<Scanner>>,

    /// Set when a single-threaded topology must scan before the next selection.
    stale: AtomicBool,

    shut_down: AtomicBool,
}

impl Drop for TopologyInner {
    fn drop(&mut self) {
        for (_, monitor) in lock(&self.monitors).drain() {
            monitor.abort();
        }
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("description", &self.description())
            .field("monitoring_mode", &self.inner.options.monitoring_mode())
            .finish()
    }
}

impl Topology {
    /// Creates a topology for the given seeds. In pooled mode this starts one background monitor
    /// per seed, so it must be called from within a tokio runtime.
    pub fn new(options: ClusterOptions) -> Result<Self> {
        options.validate()?;

        let description = TopologyDescription::new(&options);
        let (publisher, _) = watch::channel(Arc::new(description.clone()));

        let rng = match options.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_rng(&mut rand::rng()),
        };

        let scanner = options
            .is_single_threaded()
            .then(|| Mutex::new(Scanner::new()));

        let topology = Self {
            inner: Arc::new(TopologyInner {
                establisher: ConnectionEstablisher::new(&options),
                publisher,
                modification_lock: Mutex::new(()),
                rng: SyncMutex::new(rng),
                update_requester: UpdateRequester::new(),
                monitors: SyncMutex::new(HashMap::new()),
                scanner,
                stale: AtomicBool::new(true),
                shut_down: AtomicBool::new(false),
                options,
            }),
        };

        tracing::debug!(
            topology_type = %description.topology_type(),
            monitoring_mode = ?topology.inner.options.monitoring_mode(),
            seeds = topology.inner.options.hosts.len(),
            "topology opened"
        );

        for server in description.servers() {
            topology.start_monitor(server.id(), server.address().clone());
        }

        Ok(topology)
    }

    pub(crate) fn options(&self) -> &ClusterOptions {
        &self.inner.options
    }

    pub(crate) fn establisher(&self) -> &ConnectionEstablisher {
        &self.inner.establisher
    }

    pub(crate) fn scanner(&self) -> Option<&Mutex<Scanner>> {
        self.inner.scanner.as_ref()
    }

    pub(crate) fn downgrade(&self) -> WeakTopology {
        WeakTopology {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The current snapshot of the topology. The snapshot never changes once handed out.
    pub fn description(&self) -> Arc<TopologyDescription> {
        self.inner.publisher.borrow().clone()
    }

    /// Subscribes to new snapshots.
    pub fn watch(&self) -> watch::Receiver<Arc<TopologyDescription>> {
        self.inner.publisher.subscribe()
    }

    pub(crate) fn server_description(&self, id: ServerId) -> Option<ServerDescription> {
        self.inner.publisher.borrow().server_by_id(id).cloned()
    }

    /// Begins a modification of the topology. The returned guard holds the modification lock
    /// and a private copy of the description; [`TopologyModification::commit`] publishes the
    /// copy, and dropping the guard discards it.
    pub async fn modify(&self) -> TopologyModification<'_> {
        let guard = self.inner.modification_lock.lock().await;
        let description = TopologyDescription::clone(&self.inner.publisher.borrow());
        TopologyModification {
            topology: self,
            description,
            _guard: guard,
        }
    }

    /// Whether [`Topology::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    fn check_shutdown(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(ErrorKind::Shutdown.into());
        }
        Ok(())
    }

    fn rng(&self) -> SyncMutexGuard<'_, SmallRng> {
        lock(&self.inner.rng)
    }

    /// Chooses a server for an operation, blocking until one is suitable or the server selection
    /// timeout elapses.
    ///
    /// In pooled mode this waits for the background monitors to publish a suitable snapshot,
    /// requesting an immediate check of every server whenever a selection attempt fails. In
    /// single-threaded mode the calling task scans the deployment itself whenever the
    /// description is stale.
    pub async fn select_server_id(
        &self,
        operation_type: OperationType,
        read_preference: &ReadPreference,
    ) -> Result<SelectedServer> {
        match self.inner.scanner {
            Some(ref scanner) => {
                self.select_single_threaded(scanner, operation_type, read_preference)
                    .await
            }
            None => self.select_pooled(operation_type, read_preference).await,
        }
    }

    fn try_select(
        &self,
        description: &TopologyDescription,
        operation_type: OperationType,
        read_preference: &ReadPreference,
    ) -> Result<Option<SelectedServer>> {
        let mut rng = self.rng();
        description.select(operation_type, read_preference, &mut *rng)
    }

    async fn select_pooled(
        &self,
        operation_type: OperationType,
        read_preference: &ReadPreference,
    ) -> Result<SelectedServer> {
        let timeout = self.inner.options.server_selection_timeout();
        let start = Instant::now();
        let mut watcher = self.inner.publisher.subscribe();

        loop {
            self.check_shutdown()?;

            let description = watcher.borrow_and_update().clone();
            if let Some(selected) =
                self.try_select(&description, operation_type, read_preference)?
            {
                return Ok(selected);
            }

            self.request_scan();

            // Every wakeup re-runs selection against the newest snapshot.
            let change = match timeout.checked_sub(start.elapsed()) {
                Some(remaining) => tokio::time::timeout(remaining, watcher.changed())
                    .await
                    .ok(),
                None => None,
            };
            if change.is_none() {
                return Err(Error::server_selection(format!(
                    "No suitable servers found: `serverSelectionTimeoutMS` expired:{}",
                    description.server_errors()
                )));
            }
        }
    }

    async fn select_single_threaded(
        &self,
        scanner: &Mutex<Scanner>,
        operation_type: OperationType,
        read_preference: &ReadPreference,
    ) -> Result<SelectedServer> {
        let options = &self.inner.options;
        let try_once = options.server_selection_try_once();
        let heartbeat_freq = options.heartbeat_freq();
        let min_heartbeat_freq = options.min_heartbeat_freq();

        let mut loop_start = Instant::now();
        let expire_at = loop_start + options.server_selection_timeout();
        let mut tried_once = false;

        if scanner
            .lock()
            .await
            .last_scan()
            .map_or(true, |last_scan| last_scan + heartbeat_freq < loop_start)
        {
            self.inner.stale.store(true, Ordering::SeqCst);
        }

        loop {
            self.check_shutdown()?;

            if self.inner.stale.load(Ordering::SeqCst) {
                let mut scanner = scanner.lock().await;

                if try_once && scanner.in_cooldown(self, loop_start) {
                    return Err(Error::server_selection("No servers yet eligible for rescan"));
                }

                if let Some(last_scan) = scanner.last_scan() {
                    let scan_ready = last_scan + min_heartbeat_freq;
                    if scan_ready > expire_at && !try_once {
                        return Err(Error::server_selection(
                            "No suitable servers found: `serverselectiontimeoutms` timed out",
                        ));
                    }
                    if scan_ready > loop_start {
                        tokio::time::sleep(scan_ready.saturating_duration_since(Instant::now()))
                            .await;
                    }
                }

                scanner.scan(self, try_once).await;
                self.inner.stale.store(false, Ordering::SeqCst);
                tried_once = true;
            }

            let description = self.description();
            if let Some(selected) =
                self.try_select(&description, operation_type, read_preference)?
            {
                return Ok(selected);
            }

            self.inner.stale.store(true, Ordering::SeqCst);

            if try_once {
                if tried_once {
                    return Err(Error::server_selection(format!(
                        "No suitable servers found (`serverSelectionTryOnce` set):{}",
                        description.server_errors()
                    )));
                }
            } else if Instant::now() > expire_at {
                return Err(Error::server_selection(format!(
                    "No suitable servers found: `serverSelectionTimeoutMS` expired:{}",
                    description.server_errors()
                )));
            }

            loop_start = Instant::now();
        }
    }

    /// Asks for every server to be checked as soon as possible. In pooled mode this wakes the
    /// monitors; in single-threaded mode the next selection scans.
    pub fn request_scan(&self) {
        if self.inner.scanner.is_some() {
            self.inner.stale.store(true, Ordering::SeqCst);
        } else {
            self.inner.update_requester.request();
        }
    }

    /// Checks every server once. Single-threaded topologies scan inline, skipping servers that
    /// are cooling down after a failure when `obey_cooldown` is set. Pooled topologies only
    /// wake their monitors.
    pub async fn scan_once(&self, obey_cooldown: bool) -> Result<()> {
        self.check_shutdown()?;
        match self.inner.scanner {
            Some(ref scanner) => {
                scanner.lock().await.scan(self, obey_cooldown).await;
                self.inner.stale.store(false, Ordering::SeqCst);
            }
            None => self.request_scan(),
        }
        Ok(())
    }

    /// Applies the outcome of a check of one server, as performed by a monitor or a scan.
    pub(crate) async fn handle_hello(
        &self,
        id: ServerId,
        reply: Result<HelloReply>,
        round_trip_time: Option<Duration>,
    ) {
        if self.is_shut_down() {
            return;
        }
        let mut modification = self.modify().await;
        modification.handle_hello(id, reply, round_trip_time);
        modification.commit();
    }

    /// Applies a failed check of one server: the server becomes Unknown and its pool is cleared.
    pub(crate) async fn handle_monitor_error(&self, id: ServerId, error: Error) {
        if self.is_shut_down() {
            return;
        }
        let mut modification = self.modify().await;
        if modification.topology_type() == TopologyType::LoadBalanced {
            return;
        }
        modification.handle_hello(id, Err(error), None);
        modification.clear_connection_pool(id, None);
        modification.commit();
    }

    /// Applies the handshake of a new application connection to the topology. Returns false if
    /// the server is no longer part of the topology afterwards, in which case the connection must
    /// not be used.
    pub(crate) async fn update_from_handshake(
        &self,
        id: ServerId,
        reply: &HelloReply,
        round_trip_time: Duration,
    ) -> bool {
        let mut modification = self.modify().await;

        if modification.topology_type() == TopologyType::LoadBalanced {
            return true;
        }
        if modification.server_by_id(id).is_none() {
            return false;
        }

        modification.handle_hello(id, Ok(reply.clone()), Some(round_trip_time));
        let still_present = modification.server_by_id(id).is_some();
        modification.commit();
        still_present
    }

    /// Folds an error observed on an application connection into the topology. Returns whether
    /// the server's connection pool was cleared, in which case every connection to it must be
    /// dropped.
    ///
    /// Errors from connections of an older pool generation, and state change errors whose
    /// topology version is not newer than the one already recorded, are stale and ignored.
    pub async fn handle_application_error(
        &self,
        address: &ServerAddress,
        error: &Error,
        phase: HandshakePhase,
    ) -> bool {
        if self.is_shut_down() {
            return false;
        }

        let description = self.description();
        let Some(server) = description.server_by_address(address) else {
            return false;
        };
        let id = server.id();
        let service_id = phase.service_id();

        if description.topology_type() == TopologyType::LoadBalanced
            && phase.is_before_completion()
        {
            return false;
        }
        if phase.generation() < server.generation(service_id) {
            tracing::trace!(
                server = %address,
                generation = phase.generation(),
                "ignoring error from a stale connection"
            );
            return false;
        }

        if phase.is_before_completion()
            && (error.is_stream_error() || error.is_auth_error() || error.is_command_error())
        {
            return self.mark_unknown_and_clear(id, service_id, &phase, error).await;
        }

        if error.is_state_change_error() {
            return self
                .handle_state_change_error(id, service_id, &phase, error)
                .await;
        }

        if error.is_network_timeout() {
            // A timeout on an established connection says nothing about the server.
            return false;
        }

        if error.is_stream_error() {
            return self.mark_unknown_and_clear(id, service_id, &phase, error).await;
        }

        false
    }

    async fn mark_unknown_and_clear(
        &self,
        id: ServerId,
        service_id: Option<ObjectId>,
        phase: &HandshakePhase,
        error: &Error,
    ) -> bool {
        let mut modification = self.modify().await;
        let Some(server) = modification.server_by_id(id) else {
            return false;
        };
        if phase.generation() < server.generation(service_id) {
            return false;
        }

        modification.invalidate_server(id, error.clone());
        modification.clear_connection_pool(id, service_id);
        modification.commit();

        if self.inner.scanner.is_none() {
            self.request_scan();
        }
        true
    }

    async fn handle_state_change_error(
        &self,
        id: ServerId,
        service_id: Option<ObjectId>,
        phase: &HandshakePhase,
        error: &Error,
    ) -> bool {
        let incoming = error.topology_version();
        if let Some(server) = self.server_description(id) {
            if !is_newer(incoming, server.topology_version()) {
                tracing::trace!(
                    server = %server.address(),
                    "ignoring state change error with a stale topology version"
                );
                return false;
            }
        }

        let mut modification = self.modify().await;
        let Some(server) = modification.server_by_id(id) else {
            return false;
        };
        // Another task may have applied a newer error while the lock was contended.
        if phase.generation() < server.generation(service_id)
            || !is_newer(incoming, server.topology_version())
        {
            return false;
        }

        let max_wire_version = phase
            .wire_version()
            .or_else(|| server.max_wire_version())
            .unwrap_or(0);
        let clear_pool = max_wire_version <= CLEAR_POOL_ON_STATE_CHANGE_MAX_WIRE_VERSION
            || error.is_shutting_down();

        if clear_pool {
            modification.clear_connection_pool(id, service_id);
        }
        modification.invalidate_server(id, error.clone());
        modification.commit();

        if self.inner.scanner.is_some() {
            if error.is_notwritableprimary() {
                self.inner.stale.store(true, Ordering::SeqCst);
            }
        } else {
            self.request_scan();
        }

        clear_pool
    }

    /// Advances the topology's cluster time if `cluster_time` is newer.
    pub(crate) async fn advance_cluster_time(&self, cluster_time: &ClusterTime) {
        if self
            .description()
            .cluster_time()
            .is_some_and(|current| current >= cluster_time)
        {
            return;
        }
        let mut modification = self.modify().await;
        modification.advance_cluster_time(cluster_time);
        modification.commit();
    }

    /// Applies a freshly resolved SRV host list. See
    /// [`TopologyDescription::reconcile_srv_hosts`].
    pub async fn reconcile_srv_hosts(&self, hosts: &[ServerAddress]) {
        let mut modification = self.modify().await;
        {
            let mut rng = self.rng();
            modification.reconcile_srv_hosts(hosts, &mut *rng);
        }
        modification.commit();
    }

    /// Stops every monitor, closes every scanner connection, and fails all pending and future
    /// server selections with a shutdown error.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        for (_, monitor) in lock(&self.inner.monitors).drain() {
            monitor.abort();
        }
        if let Some(ref scanner) = self.inner.scanner {
            scanner.lock().await.close();
        }

        // Wake selectors so they observe the flag.
        self.inner.publisher.send_modify(|_| {});
        tracing::debug!("topology shut down");
    }

    fn start_monitor(&self, id: ServerId, address: ServerAddress) {
        if self.inner.scanner.is_some()
            || self.inner.options.is_load_balanced()
            || self.is_shut_down()
        {
            return;
        }
        let handle = Monitor::start(
            id,
            address,
            self.downgrade(),
            self.inner.update_requester.subscribe(),
        );
        lock(&self.inner.monitors).insert(id, handle);
    }

    fn stop_monitor(&self, id: ServerId) {
        if let Some(monitor) = lock(&self.inner.monitors).remove(&id) {
            monitor.abort();
        }
    }

    /// Publishes a new description, starting and stopping monitors for servers that were added or
    /// removed. Selectors are only woken if something they consult changed.
    fn publish(&self, new_description: TopologyDescription) {
        let current = self.description();

        let changes = current.diff(&new_description).map(|diff| {
            for (previous, new) in diff.changed_servers.iter() {
                if previous.server_type() != new.server_type() {
                    tracing::trace!(
                        server = %new.address(),
                        server_id = %new.id(),
                        previous_type = ?previous.server_type(),
                        new_type = ?new.server_type(),
                        "server type changed"
                    );
                }
            }

            let added: Vec<(ServerId, ServerAddress)> = diff
                .added
                .iter()
                .filter_map(|id| new_description.server_by_id(*id))
                .map(|server| (server.id(), server.address().clone()))
                .collect();
            let removed: Vec<ServerId> = diff.removed.iter().copied().collect();
            (added, removed)
        });

        let Some((added, removed)) = changes else {
            // Cluster time and session timeout updates don't wake selectors.
            self.inner.publisher.send_if_modified(|description| {
                *description = Arc::new(new_description);
                false
            });
            return;
        };

        if current.topology_type() != new_description.topology_type() {
            tracing::debug!(
                previous_type = %current.topology_type(),
                new_type = %new_description.topology_type(),
                "topology type changed"
            );
        }
        tracing::trace!(topology = %new_description, "topology description changed");

        for id in removed {
            tracing::debug!(server_id = %id, "server removed from topology");
            self.stop_monitor(id);
        }
        for (id, address) in added {
            tracing::debug!(server = %address, server_id = %id, "server added to topology");
            self.start_monitor(id, address);
        }

        self.inner.publisher.send_replace(Arc::new(new_description));
    }
}

/// An in-progress modification of a [`Topology`]. Dereferences to a private copy of the
/// description; nothing is visible to other tasks until [`TopologyModification::commit`] is
/// called. Dropping the guard discards the changes.
pub struct TopologyModification<'a> {
    topology: &'a Topology,
    description: TopologyDescription,
    _guard: MutexGuard<'a, ()>,
}

impl TopologyModification<'_> {
    /// Publishes the modified description and releases the modification lock.
    pub fn commit(self) {
        self.topology.publish(self.description);
    }
}

impl Deref for TopologyModification<'_> {
    type Target = TopologyDescription;

    fn deref(&self) -> &Self::Target {
        &self.description
    }
}

impl DerefMut for TopologyModification<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.description
    }
}

impl fmt::Debug for TopologyModification<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TopologyModification")
            .field(&self.description)
            .finish()
    }
}

/// A handle that does not keep the topology alive. Monitors hold one so that dropping every
/// [`Topology`] stops them.
#[derive(Clone, Debug)]
pub(crate) struct WeakTopology {
    inner: Weak<TopologyInner>,
}

impl WeakTopology {
    pub(crate) fn upgrade(&self) -> Option<Topology> {
        self.inner.upgrade().map(|inner| Topology { inner })
    }
}

#[derive(Debug)]
struct UpdateRequester {
    sender: broadcast::Sender<()>,
}

impl UpdateRequester {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }

    fn request(&self) {
        let _ = self.sender.send(());
    }

    fn subscribe(&self) -> TopologyUpdateRequestReceiver {
        TopologyUpdateRequestReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

pub(crate) struct TopologyUpdateRequestReceiver {
    receiver: broadcast::Receiver<()>,
}

impl TopologyUpdateRequestReceiver {
    /// Waits until a check is requested or `timeout` elapses.
    pub(crate) async fn wait_for_update_request(&mut self, timeout: Duration) {
        let _: std::result::Result<_, _> = runtime::timeout(timeout, self.receiver.recv()).await;
    }

    pub(crate) fn clear_update_requests(&mut self) {
        while self.receiver.try_recv().is_ok() {}
    }
}

/// Describes a point in time during an operation's execution relative to the handshake of the
/// connection being used in that operation.
///
/// This is used to determine the error handling semantics for certain error types.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum HandshakePhase {
    /// Describes a point that occurred before the initial hello completed (e.g. when opening the
    /// socket).
    PreHello {
        /// The pool generation of the server when the connection was attempted.
        generation: u32,
    },

    /// Describes a point in time after the initial hello has completed, but before the entire
    /// handshake (e.g. including authentication) completes.
    PostHello {
        /// The pool generation the connection was assigned.
        generation: u32,

        /// The backend service the connection reached, when load balanced.
        service_id: Option<ObjectId>,
    },

    /// Describes a point in time after the handshake completed (e.g. when the command was sent to
    /// the server).
    AfterCompletion {
        /// The pool generation the connection was assigned.
        generation: u32,

        /// The backend service the connection reached, when load balanced.
        service_id: Option<ObjectId>,

        /// The max wire version reported by the server in the handshake.
        max_wire_version: i32,
    },
}

impl HandshakePhase {
    pub(crate) fn after_completion(handshaked_connection: &Connection) -> Self {
        Self::AfterCompletion {
            generation: handshaked_connection.generation,
            service_id: handshaked_connection.service_id(),
            // A handshaked connection always has a stream description, so 0 is never used.
            max_wire_version: handshaked_connection.max_wire_version().unwrap_or(0),
        }
    }

    /// The pool generation the connection belonged to.
    pub fn generation(&self) -> u32 {
        match self {
            Self::PreHello { generation }
            | Self::PostHello { generation, .. }
            | Self::AfterCompletion { generation, .. } => *generation,
        }
    }

    /// The `serviceId` reported by the server. If the initial hello has not completed, returns
    /// `None`.
    pub fn service_id(&self) -> Option<ObjectId> {
        match self {
            Self::PreHello { .. } => None,
            Self::PostHello { service_id, .. } | Self::AfterCompletion { service_id, .. } => {
                *service_id
            }
        }
    }

    /// Whether this phase is before the handshake completed or not.
    pub fn is_before_completion(&self) -> bool {
        !matches!(self, Self::AfterCompletion { .. })
    }

    /// The wire version of the server as reported by the handshake. If the handshake did not
    /// complete, this returns `None`.
    pub fn wire_version(&self) -> Option<i32> {
        match self {
            Self::AfterCompletion {
                max_wire_version, ..
            } => Some(*max_wire_version),
            _ => None,
        }
    }
}

/// Whether an error's topology version should be applied over the recorded one. Versions from a
/// different process, and missing versions on either side, always count as newer.
fn is_newer(incoming: Option<TopologyVersion>, existing: Option<TopologyVersion>) -> bool {
    match (incoming, existing) {
        (Some(incoming), Some(existing)) => incoming.is_more_recent_than(existing),
        _ => true,
    }
}

fn lock<T>(mutex: &SyncMutex<T>) -> SyncMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
