//! Named network registry with membership-based name resolution.
//!
//! Each network owns a subnet and hands out addresses sequentially.
//! Resolution always reads the live endpoint table, so a container that
//! leaves is unresolvable from the next query on. With persistence
//! enabled the registry is mirrored to `networks.json`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::path::Path;

use dockyard_core::container::EndpointInfo;
use dockyard_core::error::{EngineError, Result};
use dockyard_core::network::{generate_hosts_file, Subnet};
use dockyard_core::volume::is_valid_name;
use dockyard_core::{EngineConfig, Network, NetworkEndpoint};
use parking_lot::RwLock;

use crate::persist::JsonFile;

/// Serializable wrapper for the networks file.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct NetworksFile {
    networks: HashMap<String, Network>,
}

/// Creates networks and tracks container endpoints on them.
#[derive(Debug)]
pub struct NetworkManager {
    /// Pool automatic subnets are carved from
    pool: String,
    networks: RwLock<BTreeMap<String, Network>>,
    file: Option<JsonFile<NetworksFile>>,
}

impl NetworkManager {
    /// An empty registry assigning subnets from `pool`.
    pub fn new(pool: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            networks: RwLock::new(BTreeMap::new()),
            file: None,
        }
    }

    /// Open the registry described by `config`.
    ///
    /// Endpoints are dropped on load: containers do not outlive the engine.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let mut manager = Self::new(config.default_subnet.clone());
        if config.persist {
            let file = JsonFile::new(config.networks_file());
            let loaded: NetworksFile = file.load()?;
            let networks = manager.networks.get_mut();
            for (name, mut network) in loaded.networks {
                network.endpoints.clear();
                networks.insert(name, network);
            }
            tracing::debug!(count = networks.len(), "Loaded networks");
            manager.file = Some(file);
        }
        Ok(manager)
    }

    /// Create a network. The subnet defaults to the next free /24 of the pool.
    pub fn create(&self, name: &str, subnet: Option<&str>) -> Result<Network> {
        if !is_valid_name(name) {
            return Err(EngineError::ConfigError(format!(
                "invalid network name '{}'",
                name
            )));
        }

        let network = {
            let mut networks = self.networks.write();
            if networks.contains_key(name) {
                return Err(EngineError::already_exists("network", name));
            }

            let taken: Vec<String> = networks.values().map(|n| n.subnet.clone()).collect();
            let subnet = match subnet {
                Some(s) => s.parse::<Subnet>()?.to_string(),
                None => self.pool.parse::<Subnet>()?.next_free_24(&taken)?.to_string(),
            };
            if let Some(owner) = networks.values().find(|n| n.subnet == subnet) {
                return Err(EngineError::NetworkError(format!(
                    "subnet {} is already used by network '{}'",
                    subnet, owner.name
                )));
            }

            let network = Network::new(name, &subnet)?;
            networks.insert(name.to_string(), network.clone());
            network
        };

        tracing::info!(network = name, subnet = %network.subnet, gateway = %network.gateway, "Created network");
        self.save()?;
        Ok(network)
    }

    /// Remove a network. Fails with `InUse` while containers are connected.
    pub fn remove(&self, name: &str) -> Result<Network> {
        let network = {
            let mut networks = self.networks.write();
            let network = networks
                .get(name)
                .ok_or_else(|| EngineError::not_found("network", name))?;
            if !network.endpoints.is_empty() {
                return Err(EngineError::InUse {
                    kind: "network",
                    name: name.to_string(),
                    users: network.endpoints.len(),
                });
            }
            networks
                .remove(name)
                .ok_or_else(|| EngineError::not_found("network", name))?
        };

        tracing::info!(network = name, "Removed network");
        self.save()?;
        Ok(network)
    }

    pub fn get(&self, name: &str) -> Result<Network> {
        self.networks
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::not_found("network", name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.networks.read().contains_key(name)
    }

    /// All networks, sorted by name.
    pub fn list(&self) -> Vec<Network> {
        self.networks.read().values().cloned().collect()
    }

    /// Connect a container, allocating an address and registering its name.
    pub fn join(
        &self,
        container_id: &str,
        container_name: &str,
        network: &str,
    ) -> Result<NetworkEndpoint> {
        let endpoint = {
            let mut networks = self.networks.write();
            let net = networks
                .get_mut(network)
                .ok_or_else(|| EngineError::not_found("network", network))?;
            net.connect(container_id, container_name)?
        };

        tracing::info!(
            network,
            container_id,
            name = container_name,
            ip = %endpoint.ip_address,
            "Container joined network"
        );
        self.save()?;
        Ok(endpoint)
    }

    /// Disconnect a container, freeing its address and name.
    pub fn leave(&self, container_id: &str, network: &str) -> Result<NetworkEndpoint> {
        let endpoint = {
            let mut networks = self.networks.write();
            let net = networks
                .get_mut(network)
                .ok_or_else(|| EngineError::not_found("network", network))?;
            net.disconnect(container_id)?
        };

        tracing::info!(network, container_id, "Container left network");
        self.save()?;
        Ok(endpoint)
    }

    /// Disconnect a container from every network. Returns the networks left.
    pub fn leave_all(&self, container_id: &str) -> Result<Vec<String>> {
        let left: Vec<String> = {
            let mut networks = self.networks.write();
            networks
                .values_mut()
                .filter_map(|n| n.disconnect(container_id).ok().map(|_| n.name.clone()))
                .collect()
        };
        if !left.is_empty() {
            tracing::debug!(container_id, networks = ?left, "Container left all networks");
            self.save()?;
        }
        Ok(left)
    }

    /// Resolve `name` as seen by `from_container` on `network`.
    ///
    /// The querying container must itself be a member.
    pub fn resolve(&self, network: &str, from_container: &str, name: &str) -> Result<Ipv4Addr> {
        let networks = self.networks.read();
        let net = networks
            .get(network)
            .ok_or_else(|| EngineError::not_found("network", network))?;
        if !net.is_member(from_container) {
            return Err(EngineError::not_found(
                "endpoint",
                format!("{} on network {}", from_container, network),
            ));
        }
        net.resolve(name)
    }

    /// A container's endpoints, sorted by network name.
    pub fn endpoints_for(&self, container_id: &str) -> Vec<EndpointInfo> {
        self.networks
            .read()
            .values()
            .filter_map(|n| {
                n.endpoints.get(container_id).map(|e| EndpointInfo {
                    network: n.name.clone(),
                    ip_address: e.ip_address,
                    mac_address: e.mac_address.clone(),
                })
            })
            .collect()
    }

    /// Render `/etc/hosts` for a container from its current memberships.
    ///
    /// The container's own entry uses its first network by name. Peers are
    /// listed once each, on the address of the first shared network.
    pub fn hosts_file(&self, container_id: &str) -> String {
        let networks = self.networks.read();
        let mut own = None;
        let mut seen = BTreeSet::new();
        let mut peers = Vec::new();

        for net in networks.values() {
            let Some(me) = net.endpoints.get(container_id) else {
                continue;
            };
            if own.is_none() {
                own = Some((me.ip_address, me.container_name.clone()));
                seen.insert(me.container_name.clone());
            }
            for peer in net.connected() {
                if peer.container_id != container_id && seen.insert(peer.container_name.clone()) {
                    peers.push((peer.ip_address, peer.container_name.clone()));
                }
            }
        }

        generate_hosts_file(own.as_ref().map(|(ip, n)| (*ip, n.as_str())), &peers)
    }

    /// Registry file, when persistence is enabled.
    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path())
    }

    fn save(&self) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let snapshot = NetworksFile {
            networks: self
                .networks
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        file.save(&snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard_core::error::ErrorKind;
    use tempfile::TempDir;

    fn manager() -> NetworkManager {
        NetworkManager::new("10.88.0.0/16")
    }

    #[test]
    fn test_create_assigns_sequential_subnets() {
        let manager = manager();
        let a = manager.create("a", None).unwrap();
        let b = manager.create("b", None).unwrap();
        assert_eq!(a.subnet, "10.88.0.0/24");
        assert_eq!(a.gateway, Ipv4Addr::new(10, 88, 0, 1));
        assert_eq!(b.subnet, "10.88.1.0/24");
    }

    #[test]
    fn test_create_explicit_subnet() {
        let manager = manager();
        let net = manager.create("custom", Some("172.30.5.9/24")).unwrap();
        assert_eq!(net.subnet, "172.30.5.0/24");
        assert!(manager.create("clash", Some("172.30.5.0/24")).is_err());
    }

    #[test]
    fn test_create_duplicate() {
        let manager = manager();
        manager.create("a", None).unwrap();
        let err = manager.create("a", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_join_allocates_ip_and_mac() {
        let manager = manager();
        manager.create("n", None).unwrap();
        let web = manager.join("c1", "web", "n").unwrap();
        let db = manager.join("c2", "db", "n").unwrap();
        assert_eq!(web.ip_address, Ipv4Addr::new(10, 88, 0, 2));
        assert_eq!(db.ip_address, Ipv4Addr::new(10, 88, 0, 3));
        assert_eq!(web.mac_address, "02:42:0a:58:00:02");
    }

    #[test]
    fn test_join_unknown_network() {
        let manager = manager();
        let err = manager.join("c1", "web", "ghost").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_resolve_follows_membership() {
        let manager = manager();
        manager.create("n", None).unwrap();
        let web = manager.join("c1", "web", "n").unwrap();
        manager.join("c2", "db", "n").unwrap();

        assert_eq!(manager.resolve("n", "c2", "web").unwrap(), web.ip_address);

        manager.leave("c1", "n").unwrap();
        let err = manager.resolve("n", "c2", "web").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_resolve_requires_membership() {
        let manager = manager();
        manager.create("n", None).unwrap();
        manager.join("c1", "web", "n").unwrap();
        let err = manager.resolve("n", "outsider", "web").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_released_address_is_reused() {
        let manager = manager();
        manager.create("n", None).unwrap();
        let first = manager.join("c1", "web", "n").unwrap();
        manager.join("c2", "db", "n").unwrap();
        manager.leave("c1", "n").unwrap();
        let again = manager.join("c3", "cache", "n").unwrap();
        assert_eq!(again.ip_address, first.ip_address);
    }

    #[test]
    fn test_remove_in_use() {
        let manager = manager();
        manager.create("n", None).unwrap();
        manager.join("c1", "web", "n").unwrap();
        assert_eq!(manager.remove("n").unwrap_err().kind(), ErrorKind::InUse);

        manager.leave_all("c1").unwrap();
        manager.remove("n").unwrap();
        assert!(!manager.exists("n"));
    }

    #[test]
    fn test_hosts_file_lists_peers_once() {
        let manager = manager();
        manager.create("a", None).unwrap();
        manager.create("b", None).unwrap();
        manager.join("c1", "web", "a").unwrap();
        manager.join("c1", "web", "b").unwrap();
        manager.join("c2", "db", "a").unwrap();
        manager.join("c2", "db", "b").unwrap();
        manager.join("c3", "cache", "b").unwrap();

        let hosts = manager.hosts_file("c1");
        assert_eq!(
            hosts,
            "127.0.0.1 localhost\n10.88.0.2 web\n10.88.0.3 db\n10.88.1.4 cache\n"
        );
    }

    #[test]
    fn test_endpoints_for() {
        let manager = manager();
        manager.create("b", None).unwrap();
        manager.create("a", None).unwrap();
        manager.join("c1", "web", "b").unwrap();
        manager.join("c1", "web", "a").unwrap();

        let endpoints = manager.endpoints_for("c1");
        let names: Vec<&str> = endpoints.iter().map(|e| e.network.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_persisted_without_endpoints() {
        let home = TempDir::new().unwrap();
        let mut config = EngineConfig::with_home(home.path());
        config.persist = true;

        {
            let manager = NetworkManager::open(&config).unwrap();
            manager.create("n", None).unwrap();
            manager.join("c1", "web", "n").unwrap();
        }

        let reopened = NetworkManager::open(&config).unwrap();
        let net = reopened.get("n").unwrap();
        assert_eq!(net.subnet, "10.88.0.0/24");
        assert!(net.endpoints.is_empty());
        assert!(reopened.path().unwrap().exists());
    }
}
