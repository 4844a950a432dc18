//! Networks: subnets, member endpoints and name resolution.
//!
//! Addresses are handed out sequentially from a subnet. `.1` is the
//! gateway; members start at `.2`. A member is reachable by its container
//! name (or id) from the other members for as long as it is connected.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{EngineError, Result};

/// A named network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    /// CIDR, always normalized to the network address
    pub subnet: String,
    pub gateway: Ipv4Addr,
    #[serde(default = "bridge_driver")]
    pub driver: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// container id → endpoint
    #[serde(default)]
    pub endpoints: HashMap<String, NetworkEndpoint>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

fn bridge_driver() -> String {
    "bridge".to_string()
}

/// A container's attachment to one network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkEndpoint {
    pub container_id: String,
    /// Name peers resolve this container by
    pub container_name: String,
    pub ip_address: Ipv4Addr,
    pub mac_address: String,
}

/// An IPv4 subnet with sequential address allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    base: u32,
    prefix: u8,
}

impl FromStr for Subnet {
    type Err = EngineError;

    fn from_str(cidr: &str) -> Result<Self> {
        let invalid = |why: &str| EngineError::NetworkError(format!("invalid subnet '{}': {}", cidr, why));

        let (addr, prefix) = cidr.split_once('/').ok_or_else(|| invalid("missing /prefix"))?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid("bad address"))?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid("bad prefix"))?;
        // Anything smaller than a /30 has no room for a member
        if prefix > 30 {
            return Err(invalid("prefix must be at most 30"));
        }

        Ok(Self {
            base: u32::from(addr) & Self::mask(prefix),
            prefix,
        })
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.base), self.prefix)
    }
}

impl Subnet {
    fn mask(prefix: u8) -> u32 {
        u32::MAX.checked_shl(32 - prefix as u32).unwrap_or(0)
    }

    fn size(&self) -> u64 {
        1u64 << (32 - self.prefix as u32)
    }

    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base + 1)
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from((self.base as u64 + self.size() - 1) as u32)
    }

    /// Addresses available to members.
    pub fn capacity(&self) -> u64 {
        self.size() - 3
    }

    /// Lowest member address not in `used`.
    pub fn allocate(&self, used: &[Ipv4Addr]) -> Result<Ipv4Addr> {
        let last = u32::from(self.broadcast());
        (self.base + 2..last)
            .map(Ipv4Addr::from)
            .find(|ip| !used.contains(ip))
            .ok_or_else(|| EngineError::NetworkError(format!("subnet {} has no free addresses", self)))
    }

    /// First /24 of this pool that is not in `taken`.
    pub fn next_free_24(&self, taken: &[String]) -> Result<Subnet> {
        if self.prefix > 24 {
            return Err(EngineError::NetworkError(format!(
                "subnet pool {} is smaller than a /24",
                self
            )));
        }
        (0..1u32 << (24 - self.prefix as u32))
            .map(|i| Subnet {
                base: self.base + (i << 8),
                prefix: 24,
            })
            .find(|s| !taken.contains(&s.to_string()))
            .ok_or_else(|| EngineError::NetworkError(format!("subnet pool {} is exhausted", self)))
    }
}

/// Locally administered MAC derived from an address: `02:42:` + the octets.
pub fn mac_for(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("02:42:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d)
}

impl Network {
    pub fn new(name: &str, subnet: &str) -> Result<Self> {
        let subnet: Subnet = subnet.parse()?;
        Ok(Self {
            name: name.to_string(),
            subnet: subnet.to_string(),
            gateway: subnet.gateway(),
            driver: bridge_driver(),
            labels: BTreeMap::new(),
            endpoints: HashMap::new(),
            created_at: chrono::Utc::now(),
        })
    }

    /// Attach a container under `container_name`, which must be unused here.
    pub fn connect(&mut self, container_id: &str, container_name: &str) -> Result<NetworkEndpoint> {
        for taken in [container_id, container_name] {
            if self.endpoints.contains_key(taken) || self.member_by_name(taken).is_some() {
                return Err(EngineError::AlreadyExists {
                    kind: "endpoint",
                    name: format!("{} on network {}", taken, self.name),
                });
            }
        }

        let used: Vec<Ipv4Addr> = self.endpoints.values().map(|e| e.ip_address).collect();
        let ip = self.subnet.parse::<Subnet>()?.allocate(&used)?;
        let endpoint = NetworkEndpoint {
            container_id: container_id.to_string(),
            container_name: container_name.to_string(),
            ip_address: ip,
            mac_address: mac_for(ip),
        };
        self.endpoints.insert(container_id.to_string(), endpoint.clone());
        Ok(endpoint)
    }

    pub fn disconnect(&mut self, container_id: &str) -> Result<NetworkEndpoint> {
        self.endpoints.remove(container_id).ok_or_else(|| {
            EngineError::not_found("endpoint", format!("{} on network {}", container_id, self.name))
        })
    }

    pub fn is_member(&self, container_id: &str) -> bool {
        self.endpoints.contains_key(container_id)
    }

    fn member_by_name(&self, name: &str) -> Option<&NetworkEndpoint> {
        self.endpoints.values().find(|e| e.container_name == name)
    }

    /// Address of the member called `name` (or with that id) right now.
    pub fn resolve(&self, name: &str) -> Result<Ipv4Addr> {
        self.member_by_name(name)
            .or_else(|| self.endpoints.get(name))
            .map(|e| e.ip_address)
            .ok_or_else(|| EngineError::not_found("host", format!("{} on network {}", name, self.name)))
    }

    /// Members in address order.
    pub fn connected(&self) -> Vec<&NetworkEndpoint> {
        let mut members: Vec<&NetworkEndpoint> = self.endpoints.values().collect();
        members.sort_by_key(|e| e.ip_address);
        members
    }
}

/// Render `/etc/hosts`: localhost, then the container itself, then peers.
pub fn generate_hosts_file(own: Option<(Ipv4Addr, &str)>, peers: &[(Ipv4Addr, String)]) -> String {
    let mut out = String::from("127.0.0.1 localhost\n");
    let own = own.map(|(ip, name)| (ip, name.to_string()));
    for (ip, name) in own.iter().chain(peers) {
        out.push_str(&format!("{} {}\n", ip, name));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(s: &str) -> Subnet {
        s.parse().unwrap()
    }

    #[test]
    fn test_subnet_parse_normalizes() {
        assert_eq!(subnet("172.20.3.9/16").to_string(), "172.20.0.0/16");
        assert_eq!(subnet("10.1.2.0/24").gateway(), Ipv4Addr::new(10, 1, 2, 1));
        assert_eq!(subnet("10.1.2.0/24").broadcast(), Ipv4Addr::new(10, 1, 2, 255));
    }

    #[test]
    fn test_subnet_rejects_garbage() {
        for bad in ["10.1.2.0", "10.1.2/24", "10.1.2.0/x", "10.1.2.0/31", "10.1.2.0/40"] {
            assert!(bad.parse::<Subnet>().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_capacity() {
        assert_eq!(subnet("10.1.2.0/24").capacity(), 253);
        assert_eq!(subnet("10.1.2.0/29").capacity(), 5);
        assert_eq!(subnet("10.1.2.0/30").capacity(), 1);
    }

    #[test]
    fn test_allocate_fills_gaps_first() {
        let s = subnet("192.168.5.0/24");
        let used = [Ipv4Addr::new(192, 168, 5, 2), Ipv4Addr::new(192, 168, 5, 4)];
        assert_eq!(s.allocate(&used).unwrap(), Ipv4Addr::new(192, 168, 5, 3));
    }

    #[test]
    fn test_allocate_exhausted() {
        let s = subnet("192.168.5.0/30");
        let only = s.allocate(&[]).unwrap();
        assert_eq!(only, Ipv4Addr::new(192, 168, 5, 2));
        assert!(s.allocate(&[only]).is_err());
    }

    #[test]
    fn test_next_free_24() {
        let pool = subnet("10.88.0.0/16");
        assert_eq!(pool.next_free_24(&[]).unwrap().to_string(), "10.88.0.0/24");
        let taken = vec!["10.88.0.0/24".to_string(), "10.88.2.0/24".to_string()];
        assert_eq!(pool.next_free_24(&taken).unwrap().to_string(), "10.88.1.0/24");

        let tiny = subnet("10.88.0.0/24");
        assert!(tiny.next_free_24(&["10.88.0.0/24".to_string()]).is_err());
        assert!(subnet("10.88.0.0/26").next_free_24(&[]).is_err());
    }

    #[test]
    fn test_mac_for() {
        assert_eq!(mac_for(Ipv4Addr::new(172, 20, 0, 10)), "02:42:ac:14:00:0a");
    }

    #[test]
    fn test_connect_and_resolve() {
        let mut net = Network::new("backend", "172.20.0.0/24").unwrap();
        let web = net.connect("c1", "web").unwrap();
        let api = net.connect("c2", "api").unwrap();

        assert_eq!(web.ip_address, Ipv4Addr::new(172, 20, 0, 2));
        assert_eq!(api.mac_address, "02:42:ac:14:00:03");
        assert_eq!(net.resolve("api").unwrap(), api.ip_address);
        assert_eq!(net.resolve("c1").unwrap(), web.ip_address);
        assert_eq!(net.connected()[0].container_name, "web");

        net.disconnect("c2").unwrap();
        assert!(matches!(net.resolve("api"), Err(EngineError::NotFound { .. })));
        assert!(net.disconnect("c2").is_err());
    }

    #[test]
    fn test_connect_rejects_taken_names() {
        let mut net = Network::new("backend", "172.20.0.0/24").unwrap();
        net.connect("c1", "web").unwrap();
        assert!(net.connect("c1", "other").is_err());
        assert!(net.connect("c2", "web").is_err());
        assert!(net.connect("c2", "c1").is_err());
    }

    #[test]
    fn test_freed_address_is_reused() {
        let mut net = Network::new("backend", "172.20.0.0/24").unwrap();
        net.connect("c1", "web").unwrap();
        net.connect("c2", "db").unwrap();
        net.disconnect("c1").unwrap();
        assert_eq!(
            net.connect("c3", "cache").unwrap().ip_address,
            Ipv4Addr::new(172, 20, 0, 2)
        );
    }

    #[test]
    fn test_network_json() {
        let mut net = Network::new("backend", "172.20.0.0/24").unwrap();
        net.connect("c1", "web").unwrap();
        let parsed: Network = serde_json::from_str(&serde_json::to_string(&net).unwrap()).unwrap();
        assert_eq!(parsed.gateway, Ipv4Addr::new(172, 20, 0, 1));
        assert_eq!(parsed.endpoints["c1"].container_name, "web");
    }

    #[test]
    fn test_hosts_file() {
        let peers = vec![(Ipv4Addr::new(172, 20, 0, 3), "db".to_string())];
        assert_eq!(
            generate_hosts_file(Some((Ipv4Addr::new(172, 20, 0, 2), "web")), &peers),
            "127.0.0.1 localhost\n172.20.0.2 web\n172.20.0.3 db\n"
        );
        assert_eq!(generate_hosts_file(None, &[]), "127.0.0.1 localhost\n");
    }
}
