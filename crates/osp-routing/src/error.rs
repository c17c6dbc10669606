use osp_core::{Address, ChannelId, NetId};

/// Errors that can occur within the routing layer.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("no route to {dest}")]
    NoRoute { dest: Address },

    #[error("next hop {0} is unreachable")]
    Unreachable(Address),

    #[error("insufficient capacity: required {required}, available {available}")]
    InsufficientCapacity { required: u128, available: u128 },

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("no bridge configured for net {0}")]
    NoBridge(NetId),

    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
}
