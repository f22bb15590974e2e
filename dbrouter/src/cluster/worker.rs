use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::{future::RemoteHandle, FutureExt};
use itertools::Itertools;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::MetadataError;
use crate::observability::RefreshStatus;
use crate::policies::listeners::{
    AcceptorUpdateHandler, ClusterStateListener, ListenerRegistry, MetadataRefreshListener,
};
use crate::utils::pretty::InstancesDisplayer;
use crate::utils::MutexExt;

use super::availability::{ClusterAvailability, ReadOnlyTargets};
use super::metadata::{ClusterType, MetadataSource, TargetCluster};
use super::metadata_reader::MetadataReader;
use super::node::NodeAddress;
use super::state::ClusterTopology;

/// Configuration of a [`TopologyCache`].
#[derive(Debug, Clone)]
pub struct TopologyCacheConfig {
    /// The cluster the router serves.
    pub target: TargetCluster,
    /// Expected type of the target cluster.
    pub cluster_type: ClusterType,
    /// Metadata servers to bootstrap from. Must not be empty.
    pub metadata_servers: Vec<NodeAddress>,
    /// Time between two refreshes.
    pub ttl: Duration,
    /// Time between two refreshes while in emergency mode.
    pub emergency_interval: Duration,
    /// Which instances may serve read-only traffic.
    pub read_only_targets: ReadOnlyTargets,
}

impl TopologyCacheConfig {
    /// Creates a configuration with default timings.
    ///
    /// # Example
    /// ```
    /// # use dbrouter::cluster::{TargetCluster, TopologyCacheConfig};
    /// # use std::time::Duration;
    /// let config = TopologyCacheConfig::new(
    ///     TargetCluster::Name("prod".to_owned()),
    ///     vec!["10.0.0.5:3306".parse().unwrap()],
    /// )
    /// .with_ttl(Duration::from_secs(2));
    /// assert_eq!(config.emergency_interval, Duration::from_secs(1));
    /// ```
    pub fn new(target: TargetCluster, metadata_servers: Vec<NodeAddress>) -> Self {
        Self {
            target,
            cluster_type: ClusterType::GroupReplication,
            metadata_servers,
            ttl: Duration::from_millis(500),
            emergency_interval: Duration::from_secs(1),
            read_only_targets: ReadOnlyTargets::default(),
        }
    }

    /// Sets the expected cluster type.
    pub fn with_cluster_type(mut self, cluster_type: ClusterType) -> Self {
        self.cluster_type = cluster_type;
        self
    }

    /// Sets the time between two refreshes.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the time between two refreshes while in emergency mode.
    pub fn with_emergency_interval(mut self, interval: Duration) -> Self {
        self.emergency_interval = interval;
        self
    }

    /// Sets which instances may serve read-only traffic.
    pub fn with_read_only_targets(mut self, read_only_targets: ReadOnlyTargets) -> Self {
        self.read_only_targets = read_only_targets;
        self
    }
}

/// Reachability of an instance, as observed by the data path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InstanceStatus {
    /// A connection to the instance succeeded.
    Reachable,
    /// The instance could not be reached.
    Unreachable,
    /// The host name of the instance could not be resolved.
    InvalidHost,
    /// The instance is reachable, but cannot serve (e.g. it refused authentication).
    Unusable,
}

/// Keeps the topology of the target cluster up to date.
///
/// Owns the background refresh task: dropping the `TopologyCache` (or calling
/// [`TopologyCache::stop`]) stops it. Everything else uses the cheaply cloneable
/// [`TopologyHandle`] returned by [`TopologyCache::handle`].
pub struct TopologyCache {
    handle: TopologyHandle,
    _worker_handle: RemoteHandle<()>,
}

/// Shared access to a [`TopologyCache`].
#[derive(Clone)]
pub struct TopologyHandle {
    shared: Arc<Shared>,
    refresh_channel: mpsc::Sender<RefreshRequest>,
    // Bumped by the worker after every commit; closed when the worker stops.
    commits: watch::Receiver<u64>,
}

struct Shared {
    topology: ArcSwap<ClusterTopology>,
    refresh_status: Mutex<RefreshStatus>,

    emergency_mode: AtomicBool,
    // Wakes the worker up, so that it recomputes its refresh cadence.
    cadence_changed: Notify,
    // Number of pending `wait_primary_failover` calls.
    failover_waiters: AtomicUsize,

    cluster_state_listeners: ListenerRegistry<dyn ClusterStateListener>,
    refresh_listeners: ListenerRegistry<dyn MetadataRefreshListener>,
    acceptor_handlers: ListenerRegistry<dyn AcceptorUpdateHandler>,
    // Set when a handler has to be called on the next refresh, changed or not.
    acceptor_update_pending: AtomicBool,
}

impl Shared {
    fn set_emergency_mode(&self, enabled: bool) {
        let was_enabled = self.emergency_mode.swap(enabled, Ordering::AcqRel);
        if was_enabled == enabled {
            return;
        }
        if enabled {
            info!("Enabling emergency mode: metadata refresh frequency is increased");
            self.cadence_changed.notify_one();
        } else {
            info!("Disabling emergency mode: metadata refresh frequency is back to normal");
        }
    }
}

// Works in the background to keep the topology updated
struct TopologyWorker {
    shared: Arc<Shared>,
    metadata_reader: MetadataReader,

    // To listen for refresh requests
    refresh_channel: mpsc::Receiver<RefreshRequest>,
    commits: watch::Sender<u64>,

    ttl: Duration,
    emergency_interval: Duration,
}

#[derive(Debug)]
struct RefreshRequest {
    response_chan: oneshot::Sender<Result<(), MetadataError>>,
}

impl TopologyCache {
    /// Starts the background refresh task. The first refresh begins immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: TopologyCacheConfig, source: Arc<dyn MetadataSource>) -> Self {
        let (refresh_sender, refresh_receiver) = mpsc::channel(32);
        let (commits_sender, commits_receiver) = watch::channel(0);

        if config.metadata_servers.is_empty() {
            warn!("No metadata servers configured, the topology will stay empty");
        }

        let shared = Arc::new(Shared {
            topology: ArcSwap::from_pointee(ClusterTopology::initial(
                config.metadata_servers.clone(),
            )),
            refresh_status: Mutex::new(RefreshStatus::default()),
            emergency_mode: AtomicBool::new(false),
            cadence_changed: Notify::new(),
            failover_waiters: AtomicUsize::new(0),
            cluster_state_listeners: ListenerRegistry::new(),
            refresh_listeners: ListenerRegistry::new(),
            acceptor_handlers: ListenerRegistry::new(),
            acceptor_update_pending: AtomicBool::new(false),
        });

        let worker = TopologyWorker {
            shared: shared.clone(),
            metadata_reader: MetadataReader::new(
                source,
                config.target,
                config.cluster_type,
                config.read_only_targets,
                config.metadata_servers,
            ),
            refresh_channel: refresh_receiver,
            commits: commits_sender,
            ttl: config.ttl,
            emergency_interval: config.emergency_interval,
        };

        let (fut, worker_handle) = worker.work().remote_handle();
        tokio::spawn(fut);

        TopologyCache {
            handle: TopologyHandle {
                shared,
                refresh_channel: refresh_sender,
                commits: commits_receiver,
            },
            _worker_handle: worker_handle,
        }
    }

    /// Returns a handle to the cache.
    pub fn handle(&self) -> TopologyHandle {
        self.handle.clone()
    }

    /// Stops the background refresh task.
    ///
    /// Pending [`TopologyHandle::wait_primary_failover`] calls return immediately,
    /// and [`TopologyHandle::refresh_now`] fails with [`MetadataError::WorkerStopped`].
    /// The last topology stays readable through existing handles.
    pub fn stop(self) {
        debug!("Stopping the topology refresh worker");
    }
}

impl TopologyHandle {
    /// Returns the current topology snapshot.
    ///
    /// The snapshot is immutable; a refresh replaces it as a whole.
    pub fn topology(&self) -> Arc<ClusterTopology> {
        self.shared.topology.load_full()
    }

    /// Counters and timestamps of the refreshes so far.
    pub fn refresh_status(&self) -> RefreshStatus {
        self.shared.refresh_status.lock_unpoisoned().clone()
    }

    /// True while refreshes run at the emergency cadence.
    pub fn is_emergency_mode(&self) -> bool {
        self.shared.emergency_mode.load(Ordering::Acquire)
    }

    /// Requests an immediate refresh and waits for its outcome.
    pub async fn refresh_now(&self) -> Result<(), MetadataError> {
        let (response_sender, response_receiver) = oneshot::channel();

        self.refresh_channel
            .send(RefreshRequest {
                response_chan: response_sender,
            })
            .await
            .map_err(|_| MetadataError::WorkerStopped)?;

        response_receiver
            .await
            .map_err(|_| MetadataError::WorkerStopped)?
    }

    /// Reports what the data path observed about an instance of the target cluster.
    ///
    /// An unreachable instance means the cached topology may be outdated,
    /// so the emergency refresh cadence is enabled.
    pub fn mark_instance_reachability(&self, address: &NodeAddress, status: InstanceStatus) {
        let topology = self.topology();
        let Some(instance) = topology
            .target_members()
            .iter()
            .find(|member| {
                member.address == *address
                    || member.address.secondary_endpoint().as_ref() == Some(address)
            })
        else {
            debug!("Ignoring reachability report about unknown instance {}", address);
            return;
        };

        match status {
            InstanceStatus::Reachable | InstanceStatus::Unusable => {}
            InstanceStatus::Unreachable => {
                info!(
                    "Instance {} [{}] is unreachable",
                    instance.address, instance.id
                );
                self.shared.set_emergency_mode(true);
            }
            InstanceStatus::InvalidHost => {
                warn!(
                    "Instance {} [{}] has an invalid host name",
                    instance.address, instance.id
                );
                self.shared.set_emergency_mode(true);
            }
        }
    }

    /// Waits until the target cluster has a primary other than `server_id`,
    /// the timeout elapses, or the cache is stopped.
    ///
    /// Returns true if a new primary was found. While waiting, refreshes run
    /// at the emergency cadence and prefer metadata servers seeing a writable member.
    pub async fn wait_primary_failover(&self, server_id: Uuid, timeout: Duration) -> bool {
        let _waiter = FailoverWaiter::register(&self.shared);
        self.shared.set_emergency_mode(true);

        let mut commits = self.commits.clone();
        commits.mark_unchanged();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.has_primary_other_than(server_id) {
                debug!("New primary elected, replacing {}", server_id);
                return true;
            }

            tokio::select! {
                changed = commits.changed() => {
                    if changed.is_err() {
                        // The worker has stopped, no new topology will come.
                        return false;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("Timed out waiting for a primary failover from {}", server_id);
                    return false;
                }
            }
        }
    }

    fn has_primary_other_than(&self, server_id: Uuid) -> bool {
        self.topology()
            .target_members()
            .iter()
            .any(|member| member.is_writable() && member.id != server_id)
    }

    /// Subscribes to topology changes.
    pub fn add_cluster_state_listener(&self, listener: &Arc<dyn ClusterStateListener>) {
        self.shared.cluster_state_listeners.add(listener);
    }

    /// Unsubscribes from topology changes.
    pub fn remove_cluster_state_listener(&self, listener: &Arc<dyn ClusterStateListener>) {
        self.shared.cluster_state_listeners.remove(listener);
    }

    /// Subscribes to every refresh.
    pub fn add_metadata_refresh_listener(&self, listener: &Arc<dyn MetadataRefreshListener>) {
        self.shared.refresh_listeners.add(listener);
    }

    /// Unsubscribes from refreshes.
    pub fn remove_metadata_refresh_listener(&self, listener: &Arc<dyn MetadataRefreshListener>) {
        self.shared.refresh_listeners.remove(listener);
    }

    /// Registers an acceptor handler. It is first called after the next refresh.
    pub fn add_acceptor_handler(&self, handler: &Arc<dyn AcceptorUpdateHandler>) {
        self.shared.acceptor_handlers.add(handler);
        self.shared
            .acceptor_update_pending
            .store(true, Ordering::Release);
    }

    /// Makes the next refresh call the acceptor handlers, even if the topology does not change.
    pub(crate) fn request_acceptor_update(&self) {
        self.shared
            .acceptor_update_pending
            .store(true, Ordering::Release);
    }

    /// Unregisters an acceptor handler.
    pub fn remove_acceptor_handler(&self, handler: &Arc<dyn AcceptorUpdateHandler>) {
        self.shared.acceptor_handlers.remove(handler);
    }
}

impl std::fmt::Debug for TopologyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyHandle")
            .field("topology", &self.shared.topology.load())
            .field("emergency_mode", &self.is_emergency_mode())
            .finish_non_exhaustive()
    }
}

/// Keeps the worker looking for a writable node while a failover wait is pending,
/// also when the waiting future is dropped midway.
struct FailoverWaiter<'a>(&'a Shared);

impl<'a> FailoverWaiter<'a> {
    fn register(shared: &'a Shared) -> Self {
        shared.failover_waiters.fetch_add(1, Ordering::AcqRel);
        Self(shared)
    }
}

impl Drop for FailoverWaiter<'_> {
    fn drop(&mut self) {
        self.0.failover_waiters.fetch_sub(1, Ordering::AcqRel);
    }
}

impl TopologyWorker {
    async fn work(mut self) {
        use tokio::time::Instant;

        let mut last_refresh_time: Option<Instant> = None;

        loop {
            let mut cur_request: Option<RefreshRequest> = None;

            if let Some(last_refresh_time) = last_refresh_time {
                // Wait until it's time for the next refresh
                let interval = if self.shared.emergency_mode.load(Ordering::Acquire) {
                    self.emergency_interval.min(self.ttl)
                } else {
                    self.ttl
                };
                let sleep_until: Instant = last_refresh_time
                    .checked_add(interval)
                    .unwrap_or_else(Instant::now);

                let sleep_future = tokio::time::sleep_until(sleep_until);
                tokio::pin!(sleep_future);

                tokio::select! {
                    _sleep_finished = sleep_future => {
                        // Time to do periodic refresh.
                    },

                    maybe_refresh_request = self.refresh_channel.recv() => {
                        match maybe_refresh_request {
                            Some(request) => cur_request = Some(request),
                            None => return, // All handles were dropped, we can stop working
                        }
                    }

                    _ = self.shared.cadence_changed.notified() => {
                        // Emergency mode was enabled; recompute the deadline.
                        continue;
                    }
                }
            }

            // Perform the refresh
            debug!("Requesting metadata refresh");
            last_refresh_time = Some(Instant::now());
            let refresh_res = self.perform_refresh().await;

            // Send refresh result if there was a request
            if let Some(request) = cur_request {
                // We can ignore sending error - if no one waits for the response we can drop it
                let _ = request.response_chan.send(refresh_res);
            }
        }
    }

    async fn perform_refresh(&mut self) -> Result<(), MetadataError> {
        let current = self.shared.topology.load_full();
        let want_writable = self.shared.emergency_mode.load(Ordering::Acquire)
            || self.shared.failover_waiters.load(Ordering::Acquire) > 0;

        let fetched = match self
            .metadata_reader
            .fetch_cluster_topology(want_writable, current.view_id)
            .await
        {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(error = %err, "Failed to refresh the cluster metadata");
                self.shared
                    .refresh_status
                    .lock_unpoisoned()
                    .record_failure(None);

                if err.is_metadata_unreachable() {
                    let emptied = current.without_members();
                    let changed = !emptied.same_members(&current);
                    self.update_topology(Arc::new(emptied), changed, false);
                }
                return Err(err);
            }
        };

        let topology = Arc::new(fetched.topology);
        let changed = !topology.same_members(&current);

        {
            let mut status = self.shared.refresh_status.lock_unpoisoned();
            if fetched.have_quorum {
                status.record_success(fetched.metadata_server);
            } else {
                status.record_failure(Some(fetched.metadata_server));
            }
        }

        self.update_topology(topology.clone(), changed, true);

        // Only now that the cycle is committed may the next one try other servers first.
        self.metadata_reader.update_metadata_servers(&topology);

        if changed && topology.target_availability() == ClusterAvailability::AvailableWritable {
            self.shared.set_emergency_mode(false);
        }

        Ok(())
    }

    fn update_topology(
        &mut self,
        topology: Arc<ClusterTopology>,
        changed: bool,
        md_servers_reachable: bool,
    ) {
        self.shared.topology.store(topology.clone());
        self.commits.send_modify(|generation| *generation += 1);

        if changed {
            if md_servers_reachable {
                info!(
                    "Potential changes detected in cluster after metadata refresh (view_id={}): {}",
                    topology.view_id,
                    InstancesDisplayer(topology.target_members())
                );
            } else {
                warn!(
                    "None of the metadata servers [{}] is reachable, dropping the cached cluster members",
                    self.metadata_reader.metadata_servers().iter().format(", ")
                );
            }

            for listener in self.shared.cluster_state_listeners.snapshot() {
                listener.on_topology_changed(&topology, md_servers_reachable, topology.view_id);
            }
        }

        for listener in self.shared.refresh_listeners.snapshot() {
            listener.on_metadata_refreshed(changed, &topology);
        }

        let update_pending = self
            .shared
            .acceptor_update_pending
            .swap(false, Ordering::AcqRel);
        if changed || update_pending {
            let mut all_updated = true;
            for handler in self.shared.acceptor_handlers.snapshot() {
                if !handler.on_acceptor_state_should_update(topology.target_members()) {
                    all_updated = false;
                }
            }
            if !all_updated {
                debug!("Some acceptors could not be updated, retrying after the next refresh");
                self.shared
                    .acceptor_update_pending
                    .store(true, Ordering::Release);
            }
        }
    }
}
