use osp_core::types::amount_str;
use osp_core::wire::CondPayRequest;
use osp_core::{
    Address, Amount, Condition, NetId, PayBuilder, PayEvent, PayId, PayLeg, PayRecord, PeerMessage, StateChange,
    TokenInfo, TransferLogic,
};
use osp_crypto::{hash_lock, random_preimage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{advance, Delivery, PayEngine};
use crate::error::NodeError;

/// Parameters of a pay this node originates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub dest: Address,
    #[serde(default = "TokenInfo::native")]
    pub token: TokenInfo,
    #[serde(with = "amount_str")]
    pub amount: Amount,
    /// Empty for a plain transfer. A multi-hop transfer without conditions
    /// gets a hash lock whose secret only we know.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub logic: TransferLogic,
    /// Sub-network of the destination; ours if absent.
    #[serde(default)]
    pub dest_net: Option<NetId>,
    /// Blocks from now until the resolve deadline.
    #[serde(default)]
    pub resolve_timeout: Option<u64>,
    #[serde(default)]
    pub note: Option<String>,
}

impl SendRequest {
    pub fn new(dest: Address, token: TokenInfo, amount: Amount) -> Self {
        Self {
            dest,
            token,
            amount,
            conditions: Vec::new(),
            logic: TransferLogic::default(),
            dest_net: None,
            resolve_timeout: None,
            note: None,
        }
    }

    pub fn conditions(mut self, conditions: Vec<Condition>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn logic(mut self, logic: TransferLogic) -> Self {
        self.logic = logic;
        self
    }

    pub fn dest_net(mut self, net: NetId) -> Self {
        self.dest_net = Some(net);
        self
    }

    pub fn resolve_timeout(mut self, blocks: u64) -> Self {
        self.resolve_timeout = Some(blocks);
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

impl PayEngine {
    /// Originate a pay. Returns once the first hop answered or could not be
    /// reached; resolution continues in the background. A pay the first hop
    /// refuses is returned as canceled rather than as an error.
    pub async fn send_payment(self: &Arc<Self>, req: SendRequest) -> Result<PayId, NodeError> {
        if req.amount == 0 {
            return Err(NodeError::InvalidRequest("amount must be positive".into()));
        }
        let local = self.local();
        let local_net = self.router.local_net();
        let dest_net = req.dest_net.unwrap_or(local_net);
        if req.dest == local && dest_net == local_net {
            return Err(NodeError::InvalidRequest("cannot pay ourselves".into()));
        }

        let route = self
            .router
            .select_route(&self.directory, &req.dest, &req.token, req.amount, dest_net)?;
        let direct = req.conditions.is_empty() && route.next_hop == req.dest && dest_net == local_net;

        let mut conditions = req.conditions;
        let mut secret = None;
        if conditions.is_empty() && !direct {
            let preimage = random_preimage();
            let hash = hash_lock(&preimage);
            conditions.push(Condition::HashLock { hash });
            secret = Some((hash, preimage));
        }

        let head = self.head().await?;
        let timeout = req.resolve_timeout.unwrap_or(self.config.resolve_timeout_blocks);
        let pay = PayBuilder::new(local, req.dest, req.token, req.amount)
            .timestamp(self.next_timestamp())
            .conditions(conditions)
            .logic(req.logic)
            .resolve_deadline(head + timeout)
            .resolver(self.router.local_resolver())
            .nets(local_net, dest_net)
            .build()?;
        let pay_id = pay.pay_id();
        self.reconcile.check_migration(&route.channel_id, pay.resolve_deadline)?;

        let handle = self
            .registry
            .get(&route.channel_id)
            .ok_or(NodeError::UnknownChannel(route.channel_id))?;
        let change = if direct {
            StateChange::DirectPay {
                pay_id,
                amount: pay.amount,
            }
        } else {
            StateChange::AddPay {
                pay_id,
                amount: pay.amount,
                resolve_deadline: pay.resolve_deadline,
            }
        };
        let note = req.note;

        let _slot = handle.send_slot().await;
        let proposal = {
            let mut ledger = handle.lock().await;
            self.transact_pay(&mut ledger, |ledger, batch, records| {
                if records.get(&pay_id)?.is_some() {
                    return Err(NodeError::DuplicatePay(pay_id));
                }
                let proposal = ledger.prepare_proposal(change, Some(pay.clone()), note.clone())?;
                let mut leg = PayLeg::new(route.channel_id, route.next_hop);
                leg.commit_seq = proposal.state.seq_num;
                advance(&mut leg, &[PayEvent::Proposed])?;

                let record = records.insert(PayRecord::new(pay.clone()));
                record.direct = direct;
                record.note = note.clone();
                record.outgoing = Some(leg);
                if let Some((hash, preimage)) = secret {
                    batch.put_secret(hash, preimage);
                }
                Ok(proposal)
            })?
        };

        tracing::info!(
            pay_id = %pay_id.short(),
            dest = %pay.dest.short(),
            amount = %pay.amount,
            next_hop = %route.next_hop.short(),
            direct,
            "sending pay"
        );
        let msg = PeerMessage::CondPayRequest(CondPayRequest { proposal, pay, note });
        if let Delivery::Refused { code, reason } = self.deliver(&handle, msg).await? {
            tracing::info!(pay_id = %pay_id.short(), %code, %reason, "first hop refused pay");
        }
        Ok(pay_id)
    }
}
