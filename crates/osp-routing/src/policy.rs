use osp_core::types::amount_str;
use osp_core::{Amount, TokenInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::RoutingError;

/// Limits applied to one token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPolicy {
    /// Smallest deposit a peer opening a channel with us must make.
    #[serde(with = "amount_str", default)]
    pub min_peer_deposit: Amount,
    /// Largest deposit we make when a peer asks us to fund our side.
    #[serde(with = "amount_str", default)]
    pub max_my_deposit: Amount,
    /// Our deposit may be at most this percentage of the peer's.
    #[serde(default = "default_match_ratio")]
    pub match_ratio_pct: u32,
    /// Largest single pay we send or forward; unlimited if absent.
    #[serde(with = "amount_str::option", default)]
    pub max_pay_amount: Option<Amount>,
}

fn default_match_ratio() -> u32 {
    100
}

impl Default for TokenPolicy {
    /// Accept opens only when we are not asked to deposit anything.
    fn default() -> Self {
        Self {
            min_peer_deposit: 0,
            max_my_deposit: 0,
            match_ratio_pct: default_match_ratio(),
            max_pay_amount: None,
        }
    }
}

impl TokenPolicy {
    pub fn check_open(&self, peer_deposit: Amount, my_deposit: Amount) -> Result<(), RoutingError> {
        if peer_deposit < self.min_peer_deposit {
            return Err(RoutingError::PolicyViolation(format!(
                "peer deposit {} below minimum {}",
                peer_deposit, self.min_peer_deposit
            )));
        }
        if my_deposit > self.max_my_deposit {
            return Err(RoutingError::PolicyViolation(format!(
                "requested deposit {} above maximum {}",
                my_deposit, self.max_my_deposit
            )));
        }
        let matched = peer_deposit.saturating_mul(self.match_ratio_pct as u128) / 100;
        if my_deposit > matched {
            return Err(RoutingError::PolicyViolation(format!(
                "requested deposit {} exceeds {}% of peer deposit",
                my_deposit, self.match_ratio_pct
            )));
        }
        Ok(())
    }

    pub fn check_pay(&self, amount: Amount) -> Result<(), RoutingError> {
        match self.max_pay_amount {
            Some(max) if amount > max => Err(RoutingError::PolicyViolation(format!(
                "pay amount {} above maximum {}",
                amount, max
            ))),
            _ => Ok(()),
        }
    }
}

/// Per-token policies with a default for tokens that have none.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    default: TokenPolicy,
    per_token: HashMap<TokenInfo, TokenPolicy>,
}

impl PolicySet {
    pub fn new(default: TokenPolicy, overrides: impl IntoIterator<Item = (TokenInfo, TokenPolicy)>) -> Self {
        Self {
            default,
            per_token: overrides.into_iter().collect(),
        }
    }

    pub fn for_token(&self, token: &TokenInfo) -> &TokenPolicy {
        self.per_token.get(token).unwrap_or(&self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osp_core::Address;

    #[test]
    fn test_default_policy_refuses_matching_deposit() {
        let policy = TokenPolicy::default();
        assert!(policy.check_open(100, 0).is_ok());
        assert!(policy.check_open(100, 1).is_err());
    }

    #[test]
    fn test_override_falls_back_to_default() {
        let erc20 = TokenInfo::erc20(Address([5; 20]));
        let generous = TokenPolicy {
            min_peer_deposit: 10,
            max_my_deposit: 1_000,
            match_ratio_pct: 50,
            max_pay_amount: Some(500),
        };
        let set = PolicySet::new(TokenPolicy::default(), [(erc20, generous.clone())]);
        assert_eq!(set.for_token(&erc20), &generous);
        assert_eq!(set.for_token(&TokenInfo::native()), &TokenPolicy::default());

        assert!(generous.check_open(5, 0).is_err());
        assert!(generous.check_open(200, 100).is_ok());
        assert!(generous.check_open(100, 100).is_err());
        assert!(generous.check_pay(501).is_err());
        assert!(generous.check_pay(500).is_ok());
    }

    #[test]
    fn test_policy_deserializes_amount_strings() {
        let policy: TokenPolicy =
            serde_json::from_str(r#"{"min_peer_deposit":"1","max_my_deposit":"10000000000000000000"}"#).unwrap();
        assert_eq!(policy.max_my_deposit, 10_000_000_000_000_000_000);
        assert_eq!(policy.match_ratio_pct, 100);
        assert_eq!(policy.max_pay_amount, None);
    }
}
