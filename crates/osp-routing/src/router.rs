use osp_core::{Address, Amount, ChannelId, ConditionalPay, NetId, TokenInfo};

use crate::error::RoutingError;
use crate::policy::PolicySet;
use crate::table::RoutingTable;

/// What routing needs to know about one of our channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelCapacity {
    pub channel_id: ChannelId,
    pub peer: Address,
    pub token: TokenInfo,
    /// Balance we can still lock toward the peer.
    pub free_local: Amount,
    /// Open and not halted.
    pub usable: bool,
}

/// The node's channels and peer liveness, as seen by the router.
pub trait ChannelDirectory: Send + Sync {
    fn channel_to(&self, peer: &Address, token: &TokenInfo) -> Option<ChannelCapacity>;

    fn capacity(&self, channel_id: &ChannelId) -> Option<ChannelCapacity>;

    /// Whether we hold any usable channel with `peer`.
    fn has_channel_with(&self, peer: &Address) -> bool;

    fn is_reachable(&self, peer: &Address) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Direct,
    Table,
    Default,
    Bridge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteChoice {
    pub channel_id: ChannelId,
    pub next_hop: Address,
    pub kind: RouteKind,
}

/// Where a pay stands relative to this node's sub-network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetHop {
    /// Source and destination are reachable inside this network.
    Local,
    /// The destination lives in another network; hand the pay to a bridge.
    Egress,
    /// The pay arrived from another network and must be re-issued locally.
    Ingress,
}

pub struct Router {
    table: RoutingTable,
    policies: PolicySet,
    local_net: NetId,
    local_resolver: Address,
}

impl Router {
    pub fn new(table: RoutingTable, policies: PolicySet, local_net: NetId, local_resolver: Address) -> Self {
        Self {
            table,
            policies,
            local_net,
            local_resolver,
        }
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    pub fn local_net(&self) -> NetId {
        self.local_net
    }

    pub fn local_resolver(&self) -> Address {
        self.local_resolver
    }

    /// Pick the channel that carries `amount` of `token` one hop closer to `dest`.
    ///
    /// Order: a bridge when `dest_net` is foreign, the direct channel, the
    /// best routing-table candidate, the default route. A candidate that is
    /// offline or short on capacity is skipped; if the last resort also fails
    /// its failure is returned rather than a generic miss.
    pub fn select_route(
        &self,
        dir: &dyn ChannelDirectory,
        dest: &Address,
        token: &TokenInfo,
        amount: Amount,
        dest_net: NetId,
    ) -> Result<RouteChoice, RoutingError> {
        self.pick(dir, dest, token, amount, dest_net, None)
    }

    /// [`select_route`](Self::select_route) for a pay we relay: the peer it
    /// came from is never chosen, so the next candidate is tried instead.
    pub fn select_forward_route(
        &self,
        dir: &dyn ChannelDirectory,
        dest: &Address,
        token: &TokenInfo,
        amount: Amount,
        dest_net: NetId,
        from: &Address,
    ) -> Result<RouteChoice, RoutingError> {
        self.pick(dir, dest, token, amount, dest_net, Some(from))
    }

    fn pick(
        &self,
        dir: &dyn ChannelDirectory,
        dest: &Address,
        token: &TokenInfo,
        amount: Amount,
        dest_net: NetId,
        exclude: Option<&Address>,
    ) -> Result<RouteChoice, RoutingError> {
        self.policies.for_token(token).check_pay(amount)?;
        let allowed = |hop: &Address| exclude != Some(hop);

        if dest_net != self.local_net {
            let bridge = self.table.net_route(dest_net).ok_or(RoutingError::NoBridge(dest_net))?;
            if !allowed(&bridge) {
                return Err(RoutingError::NoRoute { dest: *dest });
            }
            let cap = self.usable_hop(dir, &bridge, token, amount)?;
            return Ok(RouteChoice {
                channel_id: cap.channel_id,
                next_hop: bridge,
                kind: RouteKind::Bridge,
            });
        }

        let mut last_err = None;
        if allowed(dest) && dir.channel_to(dest, token).is_some() {
            match self.usable_hop(dir, dest, token, amount) {
                Ok(cap) => {
                    return Ok(RouteChoice {
                        channel_id: cap.channel_id,
                        next_hop: *dest,
                        kind: RouteKind::Direct,
                    })
                }
                Err(e) => last_err = Some(e),
            }
        }

        let best = self
            .table
            .candidates(dest)
            .into_iter()
            .filter(|hop| allowed(hop))
            .filter_map(|hop| match self.usable_hop(dir, &hop, token, amount) {
                Ok(cap) => Some((hop, cap)),
                Err(e) => {
                    tracing::debug!(dest = %dest.short(), hop = %hop.short(), error = %e, "route candidate skipped");
                    last_err = Some(e);
                    None
                }
            })
            .max_by_key(|(_, cap)| cap.free_local);
        if let Some((hop, cap)) = best {
            return Ok(RouteChoice {
                channel_id: cap.channel_id,
                next_hop: hop,
                kind: RouteKind::Table,
            });
        }

        if let Some(hop) = self.table.default_route() {
            if &hop != dest && allowed(&hop) {
                let cap = self.usable_hop(dir, &hop, token, amount)?;
                return Ok(RouteChoice {
                    channel_id: cap.channel_id,
                    next_hop: hop,
                    kind: RouteKind::Default,
                });
            }
        }

        Err(last_err.unwrap_or(RoutingError::NoRoute { dest: *dest }))
    }

    fn usable_hop(
        &self,
        dir: &dyn ChannelDirectory,
        hop: &Address,
        token: &TokenInfo,
        amount: Amount,
    ) -> Result<ChannelCapacity, RoutingError> {
        let cap = dir
            .channel_to(hop, token)
            .filter(|c| c.usable)
            .ok_or(RoutingError::NoRoute { dest: *hop })?;
        if !dir.is_reachable(hop) {
            return Err(RoutingError::Unreachable(*hop));
        }
        if cap.free_local < amount {
            return Err(RoutingError::InsufficientCapacity {
                required: amount,
                available: cap.free_local,
            });
        }
        Ok(cap)
    }

    /// Next hop for a routed control message toward `dest` in `dest_net`.
    /// Capacity plays no part; any usable channel in any token will do.
    pub fn select_message_hop(
        &self,
        dir: &dyn ChannelDirectory,
        dest: &Address,
        dest_net: NetId,
    ) -> Result<Address, RoutingError> {
        let usable = |hop: &Address| dir.has_channel_with(hop) && dir.is_reachable(hop);
        if dest_net != self.local_net {
            let bridge = self.table.net_route(dest_net).ok_or(RoutingError::NoBridge(dest_net))?;
            return if usable(&bridge) {
                Ok(bridge)
            } else {
                Err(RoutingError::Unreachable(bridge))
            };
        }
        if usable(dest) {
            return Ok(*dest);
        }
        self.table
            .candidates(dest)
            .into_iter()
            .chain(self.table.default_route())
            .find(|hop| usable(hop))
            .ok_or(RoutingError::NoRoute { dest: *dest })
    }

    /// Check that `amount` can be locked on `channel_id` under policy.
    pub fn admit(&self, dir: &dyn ChannelDirectory, channel_id: &ChannelId, amount: Amount) -> Result<(), RoutingError> {
        let cap = dir
            .capacity(channel_id)
            .ok_or(RoutingError::UnknownChannel(*channel_id))?;
        if !cap.usable {
            return Err(RoutingError::PolicyViolation("channel is not open".into()));
        }
        self.policies.for_token(&cap.token).check_pay(amount)?;
        if cap.free_local < amount {
            return Err(RoutingError::InsufficientCapacity {
                required: amount,
                available: cap.free_local,
            });
        }
        Ok(())
    }

    /// Check a peer-initiated open against the token's policy.
    pub fn admit_open(&self, token: &TokenInfo, peer_deposit: Amount, my_deposit: Amount) -> Result<(), RoutingError> {
        self.policies.for_token(token).check_open(peer_deposit, my_deposit)
    }

    pub fn classify(&self, pay: &ConditionalPay) -> NetHop {
        if pay.dest_net != self.local_net {
            NetHop::Egress
        } else if pay.src_net != self.local_net && pay.pay_resolver != self.local_resolver {
            NetHop::Ingress
        } else {
            NetHop::Local
        }
    }

    /// Re-issue a pay that entered this network under the local resolver. The
    /// result has a different pay id; everything else is unchanged.
    pub fn derive_ingress(&self, pay: &ConditionalPay) -> ConditionalPay {
        ConditionalPay {
            pay_resolver: self.local_resolver,
            ..pay.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::TokenPolicy;
    use osp_core::PayBuilder;
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    struct FakeDirectory {
        channels: HashMap<Address, ChannelCapacity>,
        offline: HashSet<Address>,
    }

    impl FakeDirectory {
        fn with(mut self, peer: u8, free: Amount) -> Self {
            let peer = Address([peer; 20]);
            self.channels.insert(
                peer,
                ChannelCapacity {
                    channel_id: ChannelId([peer.0[0]; 32]),
                    peer,
                    token: TokenInfo::native(),
                    free_local: free,
                    usable: true,
                },
            );
            self
        }

        fn offline(mut self, peer: u8) -> Self {
            self.offline.insert(Address([peer; 20]));
            self
        }
    }

    impl ChannelDirectory for FakeDirectory {
        fn channel_to(&self, peer: &Address, token: &TokenInfo) -> Option<ChannelCapacity> {
            self.channels.get(peer).filter(|c| &c.token == token).copied()
        }

        fn capacity(&self, channel_id: &ChannelId) -> Option<ChannelCapacity> {
            self.channels.values().find(|c| &c.channel_id == channel_id).copied()
        }

        fn has_channel_with(&self, peer: &Address) -> bool {
            self.channels.contains_key(peer)
        }

        fn is_reachable(&self, peer: &Address) -> bool {
            !self.offline.contains(peer)
        }
    }

    fn router() -> Router {
        Router::new(RoutingTable::new(), PolicySet::default(), 1, Address([0xee; 20]))
    }

    fn addr(b: u8) -> Address {
        Address([b; 20])
    }

    #[test]
    fn test_direct_channel_preferred() {
        let r = router();
        r.table().add_route(addr(2), addr(3));
        let dir = FakeDirectory::default().with(2, 10).with(3, 100);
        let choice = r.select_route(&dir, &addr(2), &TokenInfo::native(), 5, 1).unwrap();
        assert_eq!(choice.next_hop, addr(2));
        assert_eq!(choice.kind, RouteKind::Direct);
    }

    #[test]
    fn test_table_picks_reachable_candidate_with_most_capacity() {
        let r = router();
        for hop in [3, 4, 5] {
            r.table().add_route(addr(9), addr(hop));
        }
        let dir = FakeDirectory::default().with(3, 50).with(4, 80).with(5, 500).offline(5);
        let choice = r.select_route(&dir, &addr(9), &TokenInfo::native(), 10, 1).unwrap();
        assert_eq!(choice.next_hop, addr(4));
        assert_eq!(choice.kind, RouteKind::Table);
    }

    #[test]
    fn test_dead_hop_is_routed_around() {
        let r = router();
        r.table().add_route(addr(9), addr(3));
        r.table().add_route(addr(9), addr(4));
        let dir = FakeDirectory::default().with(3, 50).with(4, 50).offline(3);
        let choice = r.select_route(&dir, &addr(9), &TokenInfo::native(), 10, 1).unwrap();
        assert_eq!(choice.next_hop, addr(4));
    }

    #[test]
    fn test_failures_are_explicit() {
        let r = router();
        r.table().add_route(addr(9), addr(3));
        let dir = FakeDirectory::default().with(3, 5);
        assert!(matches!(
            r.select_route(&dir, &addr(9), &TokenInfo::native(), 10, 1),
            Err(RoutingError::InsufficientCapacity { required: 10, available: 5 })
        ));
        let dir = FakeDirectory::default().with(3, 50).offline(3);
        assert!(matches!(
            r.select_route(&dir, &addr(9), &TokenInfo::native(), 10, 1),
            Err(RoutingError::Unreachable(_))
        ));
        assert!(matches!(
            r.select_route(&dir, &addr(8), &TokenInfo::native(), 10, 1),
            Err(RoutingError::NoRoute { .. })
        ));
    }

    #[test]
    fn test_forwarding_never_returns_to_sender() {
        let r = router();
        r.table().add_route(addr(9), addr(3));
        r.table().add_route(addr(9), addr(4));
        let dir = FakeDirectory::default().with(3, 500).with(4, 50);
        let choice = r
            .select_forward_route(&dir, &addr(9), &TokenInfo::native(), 10, 1, &addr(3))
            .unwrap();
        assert_eq!(choice.next_hop, addr(4));

        let r = router();
        r.table().set_default_route(Some(addr(7)));
        let dir = FakeDirectory::default().with(7, 100);
        assert!(matches!(
            r.select_forward_route(&dir, &addr(9), &TokenInfo::native(), 10, 1, &addr(7)),
            Err(RoutingError::NoRoute { .. })
        ));
    }

    #[test]
    fn test_default_route_used_last() {
        let r = router();
        r.table().set_default_route(Some(addr(7)));
        let dir = FakeDirectory::default().with(7, 100);
        let choice = r.select_route(&dir, &addr(9), &TokenInfo::native(), 10, 1).unwrap();
        assert_eq!(choice.kind, RouteKind::Default);
    }

    #[test]
    fn test_foreign_net_goes_to_bridge() {
        let r = router();
        r.table().set_net_route(2, addr(6));
        let dir = FakeDirectory::default().with(6, 100).with(9, 100);
        let choice = r.select_route(&dir, &addr(9), &TokenInfo::native(), 10, 2).unwrap();
        assert_eq!(choice.next_hop, addr(6));
        assert_eq!(choice.kind, RouteKind::Bridge);
        assert!(matches!(
            r.select_route(&dir, &addr(9), &TokenInfo::native(), 10, 3),
            Err(RoutingError::NoBridge(3))
        ));
        assert_eq!(r.select_message_hop(&dir, &addr(9), 2).unwrap(), addr(6));
    }

    #[test]
    fn test_admit_checks_capacity_and_policy() {
        let policies = PolicySet::new(
            TokenPolicy {
                max_pay_amount: Some(20),
                ..TokenPolicy::default()
            },
            [],
        );
        let r = Router::new(RoutingTable::new(), policies, 1, addr(0xee));
        let dir = FakeDirectory::default().with(3, 15);
        let cid = ChannelId([3; 32]);
        assert!(r.admit(&dir, &cid, 10).is_ok());
        assert!(matches!(r.admit(&dir, &cid, 16), Err(RoutingError::InsufficientCapacity { .. })));
        assert!(matches!(r.admit(&dir, &cid, 21), Err(RoutingError::PolicyViolation(_))));
        assert!(matches!(r.admit(&dir, &ChannelId([4; 32]), 1), Err(RoutingError::UnknownChannel(_))));
    }

    #[test]
    fn test_classify_and_derive_ingress() {
        let r = router();
        let foreign = PayBuilder::new(addr(1), addr(2), TokenInfo::native(), 5)
            .resolve_deadline(10)
            .resolver(addr(0xaa))
            .nets(2, 1)
            .build()
            .unwrap();
        assert_eq!(r.classify(&foreign), NetHop::Ingress);
        let derived = r.derive_ingress(&foreign);
        assert_ne!(derived.pay_id(), foreign.pay_id());
        assert_eq!(derived.amount, foreign.amount);
        assert_eq!(r.classify(&derived), NetHop::Local);

        let outbound = PayBuilder::new(addr(1), addr(2), TokenInfo::native(), 5)
            .resolve_deadline(10)
            .nets(1, 2)
            .build()
            .unwrap();
        assert_eq!(r.classify(&outbound), NetHop::Egress);
    }
}
