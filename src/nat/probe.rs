//! Protocol/gateway probing
//!
//! Candidate gateways are tried in order, and for each one the protocols in
//! priority order. Each protocol probes from its own fixed local port, so a
//! late answer to one protocol can never be read as an answer to another.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::nat::error::{NatError, NatResult};
use crate::nat::gateway::GatewayLocator;
use crate::nat::port_forwarding::{
    MappingProtocol, MappingRequest, MappingStats, PortMappingClient, TransportProtocol,
};
use crate::nat::ProbePorts;

/// A protocol and gateway that produced an established mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub protocol: MappingProtocol,
    pub gateway: Ipv4Addr,

    /// Host address the probe mapping was bound to
    pub internal_ip: Ipv4Addr,
}

pub struct ProbeCoordinator {
    clients: HashMap<MappingProtocol, Arc<dyn PortMappingClient>>,
    locator: GatewayLocator,
    probe_ports: ProbePorts,
    probe_lifetime: u32,
    transport: TransportProtocol,
    stats: Arc<MappingStats>,

    /// Winner of the last probe, reused until invalidated
    preferred: RwLock<Option<ProbeOutcome>>,

    /// Protocols the gateway reported as unsupported this session
    disabled: RwLock<HashSet<MappingProtocol>>,

    /// Probe ports are fixed, so probes cannot overlap
    probe_lock: Mutex<()>,
}

impl ProbeCoordinator {
    pub fn new(
        clients: HashMap<MappingProtocol, Arc<dyn PortMappingClient>>,
        locator: GatewayLocator,
        probe_ports: ProbePorts,
        probe_lifetime: u32,
        transport: TransportProtocol,
        stats: Arc<MappingStats>,
    ) -> Self {
        Self {
            clients,
            locator,
            probe_ports,
            probe_lifetime,
            transport,
            stats,
            preferred: RwLock::new(None),
            disabled: RwLock::new(HashSet::new()),
            probe_lock: Mutex::new(()),
        }
    }

    pub fn preferred(&self) -> Option<ProbeOutcome> {
        *self.preferred.read()
    }

    /// Forget the cached winner, e.g. after the host's addresses changed
    pub fn invalidate(&self) {
        if self.preferred.write().take().is_some() {
            tracing::debug!("Cleared cached port mapping protocol");
        }
    }

    pub fn is_disabled(&self, protocol: MappingProtocol) -> bool {
        self.disabled.read().contains(&protocol)
    }

    pub fn disable(&self, protocol: MappingProtocol) {
        if self.disabled.write().insert(protocol) {
            tracing::info!("{} disabled for this session", protocol);
        }
        let mut preferred = self.preferred.write();
        if preferred.map(|p| p.protocol) == Some(protocol) {
            *preferred = None;
        }
    }

    /// Deduplicated (gateway, private address) pairs in first-seen order
    fn candidates(&self, private_ips: &[Ipv4Addr]) -> Vec<(Ipv4Addr, Ipv4Addr)> {
        let mut seen = HashSet::new();
        private_ips
            .iter()
            .filter_map(|&ip| self.locator.best_match(ip).map(|gateway| (gateway, ip)))
            .filter(|(gateway, _)| seen.insert(*gateway))
            .collect()
    }

    /// Find the first protocol/gateway pair that grants a mapping
    pub async fn probe(
        &self,
        private_ips: &[Ipv4Addr],
        priority: &[MappingProtocol],
    ) -> NatResult<ProbeOutcome> {
        let _probing = self.probe_lock.lock().await;

        // Another caller may have probed while we waited
        if let Some(cached) = self.preferred() {
            if private_ips.contains(&cached.internal_ip) && priority.contains(&cached.protocol) {
                return Ok(cached);
            }
        }

        let candidates = self.candidates(private_ips);
        if candidates.is_empty() {
            tracing::warn!("No private addresses to probe from");
            return Err(NatError::NoGatewayFound);
        }

        for (gateway, internal_ip) in candidates {
            for &protocol in priority {
                if self.is_disabled(protocol) {
                    continue;
                }
                let Some(client) = self.clients.get(&protocol) else {
                    continue;
                };

                let port = self.probe_ports.port_for(protocol);
                let request = MappingRequest {
                    gateway,
                    internal_ip,
                    internal_port: port,
                    lifetime: self.probe_lifetime,
                    transport: self.transport,
                    local_port: port,
                };

                tracing::debug!("Probing {} on gateway {} from port {}", protocol, gateway, port);
                let started = Instant::now();

                match client.create_mapping(&request).await {
                    Ok(mapping) if mapping.is_established() => {
                        self.stats.record_success(protocol, started.elapsed());
                        if let Err(e) = client.delete_mapping(&mapping).await {
                            tracing::debug!("Releasing {} probe mapping failed: {}", protocol, e);
                        }

                        let outcome = ProbeOutcome {
                            protocol,
                            gateway,
                            internal_ip,
                        };
                        tracing::info!("Gateway {} supports {}", gateway, protocol);
                        *self.preferred.write() = Some(outcome);
                        return Ok(outcome);
                    }
                    Ok(mapping) => {
                        let reason = mapping
                            .err_info
                            .unwrap_or_else(|| "no external port assigned".to_string());
                        tracing::debug!("{} on {} answered without a mapping: {}", protocol, gateway, reason);
                        self.stats.record_failure(protocol, reason);
                    }
                    Err(e) => {
                        tracing::debug!("{} probe of {} failed: {}", protocol, gateway, e);
                        self.stats.record_failure(protocol, e.to_string());
                        if e.disables_protocol() {
                            self.disable(protocol);
                        }
                    }
                }
            }
        }

        tracing::warn!("Port mapping probe exhausted all gateways and protocols");
        Err(NatError::NoGatewayFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::port_forwarding::{Mapping, MappingState};
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    /// Answers every request the same way and remembers what it was asked
    struct ScriptedClient {
        protocol: MappingProtocol,
        outcome: fn(MappingProtocol) -> NatResult<()>,
        calls: SyncMutex<Vec<(Ipv4Addr, u16)>>,
        deleted: SyncMutex<usize>,
    }

    impl ScriptedClient {
        fn new(protocol: MappingProtocol, outcome: fn(MappingProtocol) -> NatResult<()>) -> Arc<Self> {
            Arc::new(Self {
                protocol,
                outcome,
                calls: SyncMutex::new(Vec::new()),
                deleted: SyncMutex::new(0),
            })
        }
    }

    #[async_trait]
    impl PortMappingClient for ScriptedClient {
        fn protocol(&self) -> MappingProtocol {
            self.protocol
        }

        async fn create_mapping(&self, request: &MappingRequest) -> NatResult<Mapping> {
            self.calls.lock().push((request.gateway, request.local_port));
            (self.outcome)(self.protocol)?;
            let mut mapping = Mapping::pending(request, self.protocol);
            mapping.external_port = Some(request.internal_port);
            mapping.lifetime = request.lifetime;
            mapping.state = MappingState::Active;
            Ok(mapping)
        }

        async fn delete_mapping(&self, _mapping: &Mapping) -> NatResult<()> {
            *self.deleted.lock() += 1;
            Ok(())
        }

        async fn refresh_mapping(&self, mapping: &Mapping) -> NatResult<Mapping> {
            Ok(mapping.clone())
        }
    }

    fn answers(_: MappingProtocol) -> NatResult<()> {
        Ok(())
    }

    fn silent(_: MappingProtocol) -> NatResult<()> {
        Err(NatError::timeout("no answer", std::time::Duration::from_secs(1)))
    }

    fn unsupported(protocol: MappingProtocol) -> NatResult<()> {
        Err(NatError::unsupported(protocol, "version mismatch"))
    }

    fn coordinator(clients: &[Arc<ScriptedClient>]) -> ProbeCoordinator {
        let clients = clients
            .iter()
            .map(|c| (c.protocol, c.clone() as Arc<dyn PortMappingClient>))
            .collect();
        ProbeCoordinator::new(
            clients,
            GatewayLocator::default(),
            ProbePorts::default(),
            120,
            TransportProtocol::Udp,
            Arc::new(MappingStats::new()),
        )
    }

    const HOST: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 37);

    #[tokio::test]
    async fn test_priority_order_and_probe_ports() {
        let pcp = ScriptedClient::new(MappingProtocol::Pcp, silent);
        let natpmp = ScriptedClient::new(MappingProtocol::NatPmp, answers);
        let probe = coordinator(&[pcp.clone(), natpmp.clone()]);

        let outcome = probe
            .probe(&[HOST], &[MappingProtocol::Pcp, MappingProtocol::NatPmp])
            .await
            .unwrap();

        assert_eq!(outcome.protocol, MappingProtocol::NatPmp);
        assert_eq!(outcome.gateway, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(outcome.internal_ip, HOST);
        assert_eq!(*pcp.calls.lock(), vec![(outcome.gateway, 55556)]);
        assert_eq!(*natpmp.calls.lock(), vec![(outcome.gateway, 55555)]);

        // Probe mapping released, winner cached
        assert_eq!(*natpmp.deleted.lock(), 1);
        assert_eq!(probe.preferred(), Some(outcome));

        probe.invalidate();
        assert_eq!(probe.preferred(), None);
    }

    #[tokio::test]
    async fn test_unsupported_disables_protocol() {
        let pcp = ScriptedClient::new(MappingProtocol::Pcp, unsupported);
        let natpmp = ScriptedClient::new(MappingProtocol::NatPmp, silent);
        let probe = coordinator(&[pcp.clone(), natpmp.clone()]);
        let priority = [MappingProtocol::Pcp, MappingProtocol::NatPmp];

        let result = probe.probe(&[HOST], &priority).await;
        assert!(matches!(result, Err(NatError::NoGatewayFound)));
        assert!(probe.is_disabled(MappingProtocol::Pcp));
        assert!(!probe.is_disabled(MappingProtocol::NatPmp));

        // PCP is skipped from now on
        let _ = probe.probe(&[HOST], &priority).await;
        assert_eq!(pcp.calls.lock().len(), 1);
        assert_eq!(natpmp.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_candidates_are_deduplicated() {
        let pcp = ScriptedClient::new(MappingProtocol::Pcp, silent);
        let probe = coordinator(&[pcp.clone()]);

        // Both addresses pick 192.168.1.1; 10.0.0.5 picks 10.0.0.1
        let ips = [HOST, Ipv4Addr::new(192, 168, 1, 80), Ipv4Addr::new(10, 0, 0, 5)];
        let result = probe.probe(&ips, &[MappingProtocol::Pcp]).await;
        assert!(matches!(result, Err(NatError::NoGatewayFound)));

        let gateways: Vec<Ipv4Addr> = pcp.calls.lock().iter().map(|(g, _)| *g).collect();
        assert_eq!(
            gateways,
            vec![Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(10, 0, 0, 1)]
        );
    }
}
