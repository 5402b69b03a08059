// src/nat/manager.rs
//! Mapping lifecycle management
//!
//! The manager owns a registry of established mappings. Each entry has a
//! refresh task renewing it before the gateway lets it lapse, and a
//! per-entry operation lock so a refresh and a deletion of the same mapping
//! never overlap on the wire. Registry updates happen under a short
//! `parking_lot` lock that is never held across network I/O.
//!
//! A background loop polls the host's private addresses; mappings whose
//! internal address disappeared are recreated on a surviving one under the
//! same id.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::nat::addresses::{AddressChange, AddressSource, AddressTracker};
use crate::nat::error::{NatError, NatResult};
use crate::nat::gateway::GatewayLocator;
use crate::nat::port_forwarding::{
    Mapping, MappingId, MappingProtocol, MappingRequest, MappingState, MappingStats,
    NatPmpClient, PcpClient, PortMappingClient, ProtocolStats, UpnpClient,
};
use crate::nat::probe::{ProbeCoordinator, ProbeOutcome};
use crate::nat::transport::{HttpTransport, UdpTransport};
use crate::nat::PortMapConfig;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle notifications for registered mappings
#[derive(Debug, Clone)]
pub enum MappingEvent {
    Created(Mapping),
    Refreshed(Mapping),

    /// Refresh failed for good; `err_info` carries the reason
    Expired(Mapping),

    /// The mapping's internal address went away. `current` is the
    /// replacement under the same id, or `None` if recreation failed.
    Migrated {
        previous: Mapping,
        current: Option<Mapping>,
    },

    Deleted(Mapping),
}

struct Entry {
    mapping: Mapping,
    refresh_task: Option<JoinHandle<()>>,
    op_lock: Arc<AsyncMutex<()>>,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<MappingId, Entry>,

    /// (internal port, protocol) pairs being negotiated
    in_flight: HashSet<(u16, MappingProtocol)>,
}

/// Clears an in-flight reservation however the negotiation ends
struct InFlight<'a> {
    registry: &'a Mutex<Registry>,
    key: (u16, MappingProtocol),
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.registry.lock().in_flight.remove(&self.key);
    }
}

struct ManagerInner {
    config: PortMapConfig,
    clients: HashMap<MappingProtocol, Arc<dyn PortMappingClient>>,
    probe: ProbeCoordinator,
    addresses: Arc<dyn AddressSource>,
    tracker: Mutex<AddressTracker>,
    registry: Mutex<Registry>,
    events: broadcast::Sender<MappingEvent>,
    stats: Arc<MappingStats>,
    reconcile_task: Mutex<Option<JoinHandle<()>>>,
}

/// Creates, refreshes, migrates and deletes port mappings
#[derive(Clone)]
pub struct MappingManager {
    inner: Arc<ManagerInner>,
}

/// Caller's reference to a registered mapping. Deleting through it after
/// the mapping is gone is a no-op.
#[derive(Debug, Clone)]
pub struct MappingHandle {
    id: MappingId,
    manager: Weak<ManagerInner>,
}

impl MappingHandle {
    pub fn id(&self) -> MappingId {
        self.id
    }

    /// Current registry snapshot, `None` once deleted or expired
    pub fn mapping(&self) -> Option<Mapping> {
        self.manager.upgrade()?.get(self.id)
    }

    pub async fn delete(&self) -> NatResult<()> {
        match self.manager.upgrade() {
            Some(inner) => inner.delete(self.id).await,
            None => Ok(()),
        }
    }
}

impl MappingManager {
    /// Manager on the host's interfaces with the default UDP and HTTP
    /// transports
    #[cfg(feature = "http-transport")]
    pub fn new(config: PortMapConfig) -> NatResult<Self> {
        use crate::nat::addresses::InterfaceAddresses;
        use crate::nat::transport::{ReqwestHttpTransport, TokioUdpTransport};

        Self::with_parts(
            config,
            Arc::new(TokioUdpTransport),
            Arc::new(ReqwestHttpTransport::new()),
            Arc::new(InterfaceAddresses),
        )
    }

    pub fn with_parts(
        config: PortMapConfig,
        udp: Arc<dyn UdpTransport>,
        http: Arc<dyn HttpTransport>,
        addresses: Arc<dyn AddressSource>,
    ) -> NatResult<Self> {
        config.validate()?;

        let mut clients: HashMap<MappingProtocol, Arc<dyn PortMappingClient>> = HashMap::new();
        clients.insert(
            MappingProtocol::NatPmp,
            Arc::new(NatPmpClient::new(udp.clone(), config.natpmp_timeout)),
        );
        clients.insert(
            MappingProtocol::Pcp,
            Arc::new(PcpClient::new(udp.clone(), config.pcp_timeout)),
        );
        clients.insert(
            MappingProtocol::Upnp,
            Arc::new(UpnpClient::new(
                udp,
                http,
                config.upnp_timeout,
                config.description.clone(),
                config.upnp_conflict_retries,
            )),
        );

        let stats = Arc::new(MappingStats::new());
        let probe = ProbeCoordinator::new(
            clients.clone(),
            GatewayLocator::new(config.gateway_table.clone()),
            config.probe_ports,
            config.probe_lifetime,
            config.transport,
            stats.clone(),
        );
        let tracker = AddressTracker::new(addresses.private_ipv4_addrs());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                clients,
                probe,
                addresses,
                tracker: Mutex::new(tracker),
                registry: Mutex::new(Registry::default()),
                events,
                stats,
                reconcile_task: Mutex::new(None),
            }),
        })
    }

    /// Start polling host addresses. Must be called inside a tokio runtime.
    pub fn start(&self) {
        let manager = Arc::downgrade(&self.inner);
        let period = self.inner.config.address_poll_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = manager.upgrade() else {
                    break;
                };
                inner.reconcile().await;
            }
        });

        let previous = self.inner.reconcile_task.lock().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        tracing::info!(
            "Port mapping manager started, polling addresses every {:?}",
            period
        );
    }

    /// Stop polling and delete every registered mapping
    pub async fn shutdown(&self) {
        let task = self.inner.reconcile_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }

        let ids: Vec<MappingId> = self.inner.registry.lock().entries.keys().copied().collect();
        let results = join_all(ids.iter().map(|&id| self.inner.delete(id))).await;

        let failures = results.iter().filter(|r| r.is_err()).count();
        if failures > 0 {
            tracing::warn!(
                "{} of {} mappings could not be released on shutdown",
                failures,
                ids.len()
            );
        } else {
            tracing::info!("Released {} mappings on shutdown", ids.len());
        }
    }

    /// Map `internal_port` on `internal_ip`, optionally restricted to one
    /// protocol
    pub async fn create(
        &self,
        internal_ip: Ipv4Addr,
        internal_port: u16,
        requested_lifetime: u32,
        preference: Option<MappingProtocol>,
    ) -> NatResult<MappingHandle> {
        check_requested_lifetime(requested_lifetime)?;
        let route = self.inner.select_route(&[internal_ip], preference).await?;
        self.inner
            .establish(route, internal_port, requested_lifetime, None)
            .await
    }

    /// Map `internal_port` on whichever private address reaches a gateway
    pub async fn create_mapping(
        &self,
        internal_port: u16,
        requested_lifetime: u32,
        preference: Option<MappingProtocol>,
    ) -> NatResult<MappingHandle> {
        check_requested_lifetime(requested_lifetime)?;
        let private_ips = self.inner.addresses.private_ipv4_addrs();
        let route = self.inner.select_route(&private_ips, preference).await?;
        self.inner
            .establish(route, internal_port, requested_lifetime, None)
            .await
    }

    /// Delete a mapping. The registry entry is removed even when the
    /// gateway cannot be reached; that error is still returned.
    pub async fn delete_mapping(&self, id: MappingId) -> NatResult<()> {
        self.inner.delete(id).await
    }

    pub fn get(&self, id: MappingId) -> Option<Mapping> {
        self.inner.get(id)
    }

    pub fn list_active_mappings(&self) -> Vec<Mapping> {
        let mut mappings: Vec<Mapping> = self
            .inner
            .registry
            .lock()
            .entries
            .values()
            .map(|entry| entry.mapping.clone())
            .collect();
        mappings.sort_by_key(|m| (m.internal_port, m.protocol.name()));
        mappings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MappingEvent> {
        self.inner.events.subscribe()
    }

    /// Poll host addresses once and migrate mappings off removed ones
    pub async fn reconcile_addresses(&self) -> AddressChange {
        self.inner.reconcile().await
    }

    pub fn preferred_route(&self) -> Option<ProbeOutcome> {
        self.inner.probe.preferred()
    }

    pub fn protocol_stats(&self, protocol: MappingProtocol) -> ProtocolStats {
        self.inner.stats.get(protocol)
    }

    pub fn statistics(&self) -> String {
        self.inner.stats.format_stats()
    }
}

/// A zero lifetime is a deletion to NAT-PMP and PCP, so it is never sent
/// as a creation request
fn check_requested_lifetime(requested_lifetime: u32) -> NatResult<()> {
    if requested_lifetime == 0 {
        return Err(NatError::InvalidRequest(
            "requested lifetime must be at least one second".to_string(),
        ));
    }
    Ok(())
}

impl ManagerInner {
    fn get(&self, id: MappingId) -> Option<Mapping> {
        self.registry
            .lock()
            .entries
            .get(&id)
            .map(|entry| entry.mapping.clone())
    }

    fn emit(&self, event: MappingEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn client(&self, protocol: MappingProtocol) -> NatResult<Arc<dyn PortMappingClient>> {
        self.clients.get(&protocol).cloned().ok_or_else(|| {
            NatError::unsupported(protocol, "no client configured for this protocol")
        })
    }

    /// Reserve (port, protocol) for one negotiation
    fn begin_request(&self, internal_port: u16, protocol: MappingProtocol) -> NatResult<InFlight<'_>> {
        let key = (internal_port, protocol);
        let mut registry = self.registry.lock();

        if registry.in_flight.contains(&key) {
            return Err(NatError::InProgress {
                port: internal_port,
                protocol,
            });
        }

        let registered = registry
            .entries
            .values()
            .any(|e| e.mapping.internal_port == internal_port && e.mapping.protocol == protocol);
        if registered {
            return Err(NatError::AlreadyMapped {
                port: internal_port,
                protocol,
            });
        }

        registry.in_flight.insert(key);
        Ok(InFlight {
            registry: &self.registry,
            key,
        })
    }

    /// Cached probe winner if it fits, otherwise a fresh probe
    async fn select_route(
        &self,
        private_ips: &[Ipv4Addr],
        preference: Option<MappingProtocol>,
    ) -> NatResult<ProbeOutcome> {
        if let Some(protocol) = preference {
            if self.probe.is_disabled(protocol) {
                return Err(NatError::unsupported(
                    protocol,
                    "gateway reported the protocol unsupported earlier this session",
                ));
            }
        }

        if let Some(cached) = self.probe.preferred() {
            let protocol_fits = preference.map_or(true, |p| p == cached.protocol);
            if protocol_fits && private_ips.contains(&cached.internal_ip) {
                return Ok(cached);
            }
        }

        let priority = match preference {
            Some(protocol) => vec![protocol],
            None => self.config.protocol_priority.clone(),
        };
        self.probe.probe(private_ips, &priority).await
    }

    /// Retry `operation` while it times out, with doubling backoff
    async fn retry_timeouts<T, F, Fut>(&self, label: &str, mut operation: F) -> NatResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = NatResult<T>>,
    {
        let mut backoff = self.config.refresh_backoff;
        let mut retries = 0;

        loop {
            match operation().await {
                Err(e) if e.is_retryable() && retries < self.config.refresh_retries => {
                    retries += 1;
                    tracing::debug!(
                        "{} timed out, retry {}/{} in {:?}",
                        label,
                        retries,
                        self.config.refresh_retries,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                result => return result,
            }
        }
    }

    async fn establish(
        self: &Arc<Self>,
        route: ProbeOutcome,
        internal_port: u16,
        requested_lifetime: u32,
        reuse_id: Option<MappingId>,
    ) -> NatResult<MappingHandle> {
        let protocol = route.protocol;
        let _in_flight = self.begin_request(internal_port, protocol)?;
        let client = self.client(protocol)?;

        let request = MappingRequest {
            gateway: route.gateway,
            internal_ip: route.internal_ip,
            internal_port,
            lifetime: requested_lifetime,
            transport: self.config.transport,
            local_port: 0,
        };
        let label = format!("{} mapping of port {}", protocol, internal_port);
        let started = Instant::now();

        let mut mapping = match self
            .retry_timeouts(&label, || client.create_mapping(&request))
            .await
        {
            Ok(mapping) if mapping.is_established() => mapping,
            Ok(mapping) => {
                let reason = mapping
                    .err_info
                    .unwrap_or_else(|| "gateway did not assign an external port".to_string());
                self.stats.record_failure(protocol, reason.clone());
                return Err(NatError::rejected(protocol, reason));
            }
            Err(e) => {
                self.stats.record_failure(protocol, e.to_string());
                if e.disables_protocol() {
                    self.probe.disable(protocol);
                } else if e.is_retryable() {
                    // The gateway stopped answering; probe again next time
                    self.probe.invalidate();
                }
                return Err(e);
            }
        };

        self.stats.record_success(protocol, started.elapsed());
        if let Some(id) = reuse_id {
            mapping.id = id;
        }

        tracing::info!(
            "Mapped {}:{} to external port {} via {} ({} seconds)",
            mapping.internal_ip,
            mapping.internal_port,
            mapping.external_port.unwrap_or(0),
            protocol,
            mapping.lifetime
        );

        let id = mapping.id;
        self.register(mapping.clone());
        self.emit(MappingEvent::Created(mapping));

        Ok(MappingHandle {
            id,
            manager: Arc::downgrade(self),
        })
    }

    fn register(self: &Arc<Self>, mapping: Mapping) {
        let id = mapping.id;
        let refresh_in =
            mapping.refresh_after(self.config.refresh_fraction, self.config.min_refresh_interval);

        let mut registry = self.registry.lock();
        registry.entries.insert(
            id,
            Entry {
                mapping,
                refresh_task: None,
                op_lock: Arc::new(AsyncMutex::new(())),
            },
        );

        match refresh_in {
            Some(delay) => {
                let task = spawn_refresh(Arc::downgrade(self), id, delay);
                if let Some(entry) = registry.entries.get_mut(&id) {
                    entry.refresh_task = Some(task);
                }
            }
            None => tracing::debug!("Mapping {} is permanent, not scheduling refresh", id),
        }
    }

    /// One refresh round. Returns the delay until the next one, or `None`
    /// when the mapping is gone or permanent.
    async fn refresh_once(&self, id: MappingId) -> Option<Duration> {
        let (mapping, op_lock) = {
            let mut registry = self.registry.lock();
            let entry = registry.entries.get_mut(&id)?;
            entry.mapping.state = MappingState::Refreshing;
            (entry.mapping.clone(), entry.op_lock.clone())
        };
        let _op = op_lock.lock().await;

        let client = self.clients.get(&mapping.protocol)?.clone();
        let label = format!("{} refresh of port {}", mapping.protocol, mapping.internal_port);

        match self
            .retry_timeouts(&label, || client.refresh_mapping(&mapping))
            .await
        {
            Ok(mut refreshed) => {
                refreshed.id = id;
                refreshed.state = MappingState::Active;
                {
                    let mut registry = self.registry.lock();
                    let entry = registry.entries.get_mut(&id)?;
                    entry.mapping = refreshed.clone();
                }

                tracing::debug!(
                    "Refreshed {} mapping of port {} for {} seconds",
                    refreshed.protocol,
                    refreshed.internal_port,
                    refreshed.lifetime
                );
                let next =
                    refreshed.refresh_after(self.config.refresh_fraction, self.config.min_refresh_interval);
                self.emit(MappingEvent::Refreshed(refreshed));
                next
            }
            Err(e) => {
                self.expire(id, e).await;
                None
            }
        }
    }

    async fn expire(&self, id: MappingId, error: NatError) {
        let removed = self.registry.lock().entries.remove(&id);
        let Some(entry) = removed else {
            return;
        };

        let mut mapping = entry.mapping;
        mapping.state = MappingState::Expired;
        mapping.err_info = Some(format!("refresh failed: {}", error));

        tracing::warn!(
            "{} mapping of port {} expired: {}",
            mapping.protocol,
            mapping.internal_port,
            error
        );
        self.stats.record_failure(mapping.protocol, error.to_string());
        if error.disables_protocol() {
            self.probe.disable(mapping.protocol);
        }

        if let Some(client) = self.clients.get(&mapping.protocol) {
            if let Err(e) = client.delete_mapping(&mapping).await {
                tracing::debug!("Releasing expired mapping {} failed: {}", id, e);
            }
        }

        self.emit(MappingEvent::Expired(mapping));
    }

    async fn delete(&self, id: MappingId) -> NatResult<()> {
        let removed = self.registry.lock().entries.remove(&id);
        let Some(entry) = removed else {
            tracing::debug!("Mapping {} already removed", id);
            return Ok(());
        };

        if let Some(task) = &entry.refresh_task {
            task.abort();
        }
        // Wait out a refresh that is mid-flight
        let _op = entry.op_lock.lock().await;

        let mut mapping = entry.mapping.clone();
        let result = match self.clients.get(&mapping.protocol) {
            Some(client) => client.delete_mapping(&mapping).await,
            None => Ok(()),
        };
        mapping.state = MappingState::Deleted;

        match &result {
            Ok(()) => tracing::info!(
                "Deleted {} mapping of port {}",
                mapping.protocol,
                mapping.internal_port
            ),
            Err(e) => tracing::warn!(
                "Gateway did not confirm deletion of {} mapping of port {}, removed locally: {}",
                mapping.protocol,
                mapping.internal_port,
                e
            ),
        }

        self.emit(MappingEvent::Deleted(mapping));
        result
    }

    async fn reconcile(self: &Arc<Self>) -> AddressChange {
        let polled = self.addresses.private_ipv4_addrs();
        let (change, surviving) = {
            let mut tracker = self.tracker.lock();
            let change = tracker.update(&polled);
            (change, tracker.current().to_vec())
        };

        if change.is_empty() {
            return change;
        }

        tracing::info!(
            "Host addresses changed: added {:?}, removed {:?}",
            change.added,
            change.removed
        );
        self.probe.invalidate();

        let stranded: Vec<Mapping> = self
            .registry
            .lock()
            .entries
            .values()
            .filter(|entry| change.removed.contains(&entry.mapping.internal_ip))
            .map(|entry| entry.mapping.clone())
            .collect();

        for previous in stranded {
            self.migrate(previous, &surviving).await;
        }

        change
    }

    /// Recreate `previous` on a surviving address under the same id
    async fn migrate(self: &Arc<Self>, previous: Mapping, surviving: &[Ipv4Addr]) {
        if let Err(e) = self.delete(previous.id).await {
            tracing::debug!("Releasing stranded mapping {} failed: {}", previous.id, e);
        }

        let result = match self.select_route(surviving, None).await {
            Ok(route) => {
                self.establish(
                    route,
                    previous.internal_port,
                    previous.requested_lifetime,
                    Some(previous.id),
                )
                .await
            }
            Err(e) => Err(e),
        };

        let current = match result {
            Ok(handle) => {
                let current = self.get(handle.id);
                tracing::info!(
                    "Migrated mapping of port {} off {}",
                    previous.internal_port,
                    previous.internal_ip
                );
                current
            }
            Err(e) => {
                tracing::warn!(
                    "Could not recreate mapping of port {} after {} went away: {}",
                    previous.internal_port,
                    previous.internal_ip,
                    e
                );
                None
            }
        };

        self.emit(MappingEvent::Migrated { previous, current });
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(task) = self.reconcile_task.get_mut().take() {
            task.abort();
        }

        let registry = self.registry.get_mut();
        for entry in registry.entries.values() {
            if let Some(task) = &entry.refresh_task {
                task.abort();
            }
        }
        if !registry.entries.is_empty() {
            tracing::debug!(
                "Dropping manager with {} mappings; they lapse at the gateway",
                registry.entries.len()
            );
        }
    }
}

fn spawn_refresh(manager: Weak<ManagerInner>, id: MappingId, first: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut delay = first;
        loop {
            tokio::time::sleep(delay).await;
            let Some(inner) = manager.upgrade() else {
                break;
            };
            match inner.refresh_once(id).await {
                Some(next) => delay = next,
                None => break,
            }
        }
    })
}
