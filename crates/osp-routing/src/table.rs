use dashmap::DashMap;
use osp_core::{Address, NetId};
use std::sync::RwLock;

/// Static routing knowledge of a node.
///
/// Each destination maps to an ordered list of candidate next hops. Pays for
/// a foreign sub-network go to that network's bridge peer instead.
pub struct RoutingTable {
    routes: DashMap<Address, Vec<Address>>,
    net_routes: DashMap<NetId, Address>,
    default_route: RwLock<Option<Address>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
            net_routes: DashMap::new(),
            default_route: RwLock::new(None),
        }
    }

    /// Add `next_hop` as a candidate toward `dest`. Duplicates are ignored.
    pub fn add_route(&self, dest: Address, next_hop: Address) {
        let mut hops = self.routes.entry(dest).or_default();
        if !hops.contains(&next_hop) {
            hops.push(next_hop);
        }
    }

    /// Replace every candidate toward `dest`.
    pub fn set_routes(&self, dest: Address, next_hops: Vec<Address>) {
        if next_hops.is_empty() {
            self.routes.remove(&dest);
        } else {
            self.routes.insert(dest, next_hops);
        }
    }

    pub fn remove_route(&self, dest: &Address, next_hop: &Address) {
        if let Some(mut hops) = self.routes.get_mut(dest) {
            hops.retain(|h| h != next_hop);
        }
        self.routes.remove_if(dest, |_, hops| hops.is_empty());
    }

    pub fn candidates(&self, dest: &Address) -> Vec<Address> {
        self.routes.get(dest).map(|h| h.value().clone()).unwrap_or_default()
    }

    pub fn set_default_route(&self, next_hop: Option<Address>) {
        if let Ok(mut slot) = self.default_route.write() {
            *slot = next_hop;
        }
    }

    pub fn default_route(&self) -> Option<Address> {
        self.default_route.read().map(|slot| *slot).unwrap_or(None)
    }

    /// Bridge peer through which `net` is reached.
    pub fn set_net_route(&self, net: NetId, bridge: Address) {
        self.net_routes.insert(net, bridge);
    }

    pub fn net_route(&self, net: NetId) -> Option<Address> {
        self.net_routes.get(&net).map(|b| *b.value())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes_dedup_and_remove() {
        let table = RoutingTable::new();
        let dest = Address([9; 20]);
        table.add_route(dest, Address([1; 20]));
        table.add_route(dest, Address([2; 20]));
        table.add_route(dest, Address([1; 20]));
        assert_eq!(table.candidates(&dest), vec![Address([1; 20]), Address([2; 20])]);

        table.remove_route(&dest, &Address([1; 20]));
        table.remove_route(&dest, &Address([2; 20]));
        assert!(table.candidates(&dest).is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_default_and_net_routes() {
        let table = RoutingTable::new();
        assert_eq!(table.default_route(), None);
        table.set_default_route(Some(Address([3; 20])));
        assert_eq!(table.default_route(), Some(Address([3; 20])));
        table.set_net_route(2, Address([4; 20]));
        assert_eq!(table.net_route(2), Some(Address([4; 20])));
        assert_eq!(table.net_route(3), None);
    }
}
