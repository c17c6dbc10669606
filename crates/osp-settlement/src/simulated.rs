//! In-process ledger chain for tests and devnets.
//!
//! Transactions execute when submitted and land in the current block. Blocks
//! advance only through [`SimulatedChain::mine_blocks`] or a miner task, so
//! tests control time exactly.

use async_trait::async_trait;
use osp_core::{
    Address, Amount, BlockNumber, ChannelId, Condition, ConditionalPay, OnChainFunds, PayId, SignedSimplexState,
};
use osp_crypto::{hash, hash_lock, verify, verify_cosigned, PublicKey};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::chain::{
    ChainEvent, ChainLog, ChannelInfo, CooperativeWithdrawTx, DepositRequest, LedgerChain, OnChainStatus,
    OpenChannelTx, PayInfo, Payout, Receipt, TxHash, WithdrawIntent,
};
use crate::error::ChainError;

#[derive(Debug, Clone)]
pub struct SimulatedChainConfig {
    /// Blocks a unilateral settle stays open for disputes.
    pub dispute_window: u64,
    /// Blocks a unilateral withdraw stays open for vetoes.
    pub withdraw_window: u64,
    /// Receipt polls answered with "not found" before a receipt shows up.
    pub receipt_delay: u32,
    /// Ledger contract new channels are opened on.
    pub ledger: Address,
}

impl Default for SimulatedChainConfig {
    fn default() -> Self {
        Self {
            dispute_window: 5,
            withdraw_window: 5,
            receipt_delay: 0,
            ledger: Address([0x1e; 20]),
        }
    }
}

struct SimChannel {
    info: ChannelInfo,
    keys: [PublicKey; 2],
    intended: [Option<SignedSimplexState>; 2],
}

struct SimTx {
    receipt: Receipt,
    polls_left: u32,
}

#[derive(Default)]
struct Inner {
    block: BlockNumber,
    channels: HashMap<ChannelId, SimChannel>,
    pays: HashMap<PayId, PayInfo>,
    outcomes: Vec<(Condition, bool)>,
    migrations: HashMap<ChannelId, (Address, BlockNumber)>,
    txs: HashMap<TxHash, SimTx>,
    logs: Vec<ChainLog>,
    injected: VecDeque<ChainError>,
    nonce: u64,
}

impl Inner {
    fn channel(&mut self, id: &ChannelId) -> Result<&mut SimChannel, ChainError> {
        self.channels
            .get_mut(id)
            .ok_or_else(|| ChainError::TxFailed(format!("unknown channel {}", id)))
    }
}

pub struct SimulatedChain {
    config: SimulatedChainConfig,
    inner: Mutex<Inner>,
}

impl SimulatedChain {
    pub fn new(config: SimulatedChainConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                block: 1,
                ..Inner::default()
            }),
        }
    }

    pub fn config(&self) -> &SimulatedChainConfig {
        &self.config
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, ChainError> {
        self.inner.lock().map_err(|_| ChainError::Rpc("chain state poisoned".into()))
    }

    pub fn head(&self) -> BlockNumber {
        self.lock().map(|s| s.block).unwrap_or(0)
    }

    pub fn mine_blocks(&self, n: u64) -> BlockNumber {
        match self.lock() {
            Ok(mut s) => {
                s.block += n;
                s.block
            }
            Err(_) => 0,
        }
    }

    /// Mine one block every `interval` until the handle is aborted.
    pub fn spawn_miner(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.mine_blocks(1);
            }
        })
    }

    /// Fail the next submission or query with `error`.
    pub fn inject_failure(&self, error: ChainError) {
        if let Ok(mut s) = self.lock() {
            s.injected.push_back(error);
        }
    }

    pub fn set_condition_outcome(&self, condition: Condition, outcome: bool) {
        if let Ok(mut s) = self.lock() {
            s.outcomes.retain(|(c, _)| c != &condition);
            s.outcomes.push((condition, outcome));
        }
    }

    /// Operator announcement that `channel_id` moves to `to_ledger` before `deadline`.
    pub fn announce_migration(
        &self,
        channel_id: ChannelId,
        to_ledger: Address,
        deadline: BlockNumber,
    ) -> Result<TxHash, ChainError> {
        self.submit(|s| {
            s.channel(&channel_id)?;
            s.migrations.insert(channel_id, (to_ledger, deadline));
            Ok(vec![ChainEvent::LedgerMigrationIntent {
                channel_id,
                to_ledger,
                deadline,
            }])
        })
    }

    /// Run a transaction. A `TxFailed` from `exec` becomes a reverted receipt;
    /// any other error refuses the submission outright.
    fn submit(&self, exec: impl FnOnce(&mut Inner) -> Result<Vec<ChainEvent>, ChainError>) -> Result<TxHash, ChainError> {
        let mut s = self.lock()?;
        if let Some(err) = s.injected.pop_front() {
            return Err(err);
        }
        s.nonce += 1;
        let mut seed = b"osp.sim.tx".to_vec();
        seed.extend_from_slice(&s.nonce.to_be_bytes());
        let tx = hash(&seed);
        let block = s.block;

        let success = match exec(&mut *s) {
            Ok(events) => {
                for event in events {
                    let index = s.logs.len() as u64;
                    s.logs.push(ChainLog {
                        index,
                        block,
                        tx,
                        event,
                    });
                }
                true
            }
            Err(ChainError::TxFailed(reason)) => {
                tracing::debug!(tx = %tx.short(), reason = %reason, "simulated tx reverted");
                false
            }
            Err(other) => return Err(other),
        };
        let polls_left = self.config.receipt_delay;
        s.txs.insert(
            tx,
            SimTx {
                receipt: Receipt { tx, block, success },
                polls_left,
            },
        );
        Ok(tx)
    }

    fn query<T>(&self, f: impl FnOnce(&Inner) -> T) -> Result<T, ChainError> {
        let mut s = self.lock()?;
        if let Some(err) = s.injected.pop_front() {
            return Err(err);
        }
        Ok(f(&*s))
    }
}

fn pool(info: &ChannelInfo) -> Result<Amount, ChainError> {
    let deposited = info.funds.iter().map(|f| f.deposit).sum::<Amount>();
    let withdrawn = info.funds.iter().map(|f| f.withdrawn).sum::<Amount>();
    deposited
        .checked_sub(withdrawn)
        .ok_or_else(|| ChainError::TxFailed("withdrawn exceeds deposits".into()))
}

fn participant(info: &ChannelInfo, who: &Address) -> Result<usize, ChainError> {
    info.index_of(who)
        .ok_or_else(|| ChainError::TxFailed(format!("{} is not a participant", who)))
}

fn fail(reason: &str) -> ChainError {
    ChainError::TxFailed(reason.to_string())
}

/// Amount a simplex sent, counting its pending pays at their resolved value.
fn sent_by(state: Option<&SignedSimplexState>, pays: &HashMap<PayId, PayInfo>) -> Amount {
    state
        .map(|s| {
            let resolved: Amount = s
                .state
                .pending_pay_ids
                .iter()
                .filter_map(|id| pays.get(id))
                .map(|p| p.amount)
                .sum();
            s.state.transfer_to_peer + resolved
        })
        .unwrap_or(0)
}

#[async_trait]
impl LedgerChain for SimulatedChain {
    async fn block_number(&self) -> Result<BlockNumber, ChainError> {
        self.query(|s| s.block)
    }

    async fn open_channel(&self, tx: OpenChannelTx) -> Result<TxHash, ChainError> {
        let terms = tx.terms.clone();
        let initiator_key = PublicKey::for_address(&tx.initiator_key, &terms.initiator)
            .map_err(|e| ChainError::Rejected(e.to_string()))?;
        let responder_key = PublicKey::for_address(&tx.responder_key, &terms.responder)
            .map_err(|e| ChainError::Rejected(e.to_string()))?;
        let ledger = self.config.ledger;
        self.submit(move |s| {
            if terms.open_deadline < s.block {
                return Err(fail("open deadline passed"));
            }
            if terms.ledger != ledger {
                return Err(fail("terms name another ledger"));
            }
            let payload = terms.signing_payload();
            verify(&payload, &tx.initiator_sig, &initiator_key).map_err(|_| fail("bad initiator signature"))?;
            verify(&payload, &tx.responder_sig, &responder_key).map_err(|_| fail("bad responder signature"))?;
            let channel_id = terms.channel_id();
            if s.channels.contains_key(&channel_id) {
                return Err(fail("channel exists"));
            }
            let funds = [
                OnChainFunds {
                    deposit: terms.initiator_deposit,
                    withdrawn: 0,
                },
                OnChainFunds {
                    deposit: terms.responder_deposit,
                    withdrawn: 0,
                },
            ];
            let participants = [terms.initiator, terms.responder];
            s.channels.insert(
                channel_id,
                SimChannel {
                    info: ChannelInfo {
                        channel_id,
                        token: terms.token,
                        ledger,
                        participants,
                        funds,
                        status: OnChainStatus::Operable,
                        settle_finalize_block: None,
                        withdraw_intent: None,
                        withdraw_seq: 0,
                        intended_seqs: [None, None],
                    },
                    keys: [initiator_key.clone(), responder_key.clone()],
                    intended: [None, None],
                },
            );
            Ok(vec![ChainEvent::ChannelOpened {
                channel_id,
                token: terms.token,
                ledger,
                participants,
                keys: [tx.initiator_key.clone(), tx.responder_key.clone()],
                funds,
            }])
        })
    }

    async fn deposit(&self, request: DepositRequest) -> Result<TxHash, ChainError> {
        self.deposit_in_batch(vec![request]).await
    }

    async fn deposit_in_batch(&self, requests: Vec<DepositRequest>) -> Result<TxHash, ChainError> {
        if requests.is_empty() {
            return Err(ChainError::Rejected("empty deposit batch".into()));
        }
        self.submit(move |s| {
            for r in &requests {
                let ch = s.channel(&r.channel_id)?;
                if ch.info.status != OnChainStatus::Operable {
                    return Err(fail("channel not operable"));
                }
                participant(&ch.info, &r.receiver)?;
            }
            let mut events = Vec::with_capacity(requests.len());
            for r in requests {
                let ch = s.channel(&r.channel_id)?;
                let i = participant(&ch.info, &r.receiver)?;
                let funds = &mut ch.info.funds[i];
                funds.deposit = funds
                    .deposit
                    .checked_add(r.amount)
                    .ok_or_else(|| fail("deposit overflow"))?;
                events.push(ChainEvent::Deposit {
                    channel_id: r.channel_id,
                    participant: r.receiver,
                    total: funds.deposit,
                });
            }
            Ok(events)
        })
    }

    async fn cooperative_withdraw(&self, tx: CooperativeWithdrawTx) -> Result<TxHash, ChainError> {
        self.submit(move |s| {
            let block = s.block;
            let ch = s.channel(&tx.terms.channel_id)?;
            if ch.info.status != OnChainStatus::Operable {
                return Err(fail("channel not operable"));
            }
            if tx.terms.deadline < block {
                return Err(fail("withdraw deadline passed"));
            }
            if tx.terms.seq != ch.info.withdraw_seq + 1 {
                return Err(fail("withdraw seq mismatch"));
            }
            let i = participant(&ch.info, &tx.terms.receiver)?;
            let payload = tx.terms.signing_payload();
            verify(&payload, &tx.requester_sig, &ch.keys[i]).map_err(|_| fail("bad requester signature"))?;
            verify(&payload, &tx.approver_sig, &ch.keys[1 - i]).map_err(|_| fail("bad approver signature"))?;
            if pool(&ch.info)? < tx.terms.amount {
                return Err(fail("insufficient channel funds"));
            }
            ch.info.funds[i].withdrawn += tx.terms.amount;
            ch.info.withdraw_seq = tx.terms.seq;
            Ok(vec![ChainEvent::CooperativeWithdraw {
                channel_id: tx.terms.channel_id,
                receiver: tx.terms.receiver,
                total_withdrawn: ch.info.funds[i].withdrawn,
                seq: tx.terms.seq,
            }])
        })
    }

    async fn intend_withdraw(
        &self,
        channel_id: ChannelId,
        receiver: Address,
        amount: Amount,
    ) -> Result<TxHash, ChainError> {
        self.submit(move |s| {
            let block = s.block;
            let ch = s.channel(&channel_id)?;
            participant(&ch.info, &receiver)?;
            if ch.info.status != OnChainStatus::Operable {
                return Err(fail("channel not operable"));
            }
            if ch.info.withdraw_intent.is_some() {
                return Err(fail("withdraw already pending"));
            }
            if pool(&ch.info)? < amount {
                return Err(fail("insufficient channel funds"));
            }
            ch.info.withdraw_intent = Some(WithdrawIntent {
                receiver,
                amount,
                requested_at: block,
            });
            Ok(vec![ChainEvent::IntendWithdraw {
                channel_id,
                receiver,
                amount,
            }])
        })
    }

    async fn confirm_withdraw(&self, channel_id: ChannelId) -> Result<TxHash, ChainError> {
        let window = self.config.withdraw_window;
        self.submit(move |s| {
            let block = s.block;
            let ch = s.channel(&channel_id)?;
            let intent = ch.info.withdraw_intent.ok_or_else(|| fail("no pending withdraw"))?;
            if block < intent.requested_at + window {
                return Err(fail("withdraw window still open"));
            }
            let i = participant(&ch.info, &intent.receiver)?;
            ch.info.funds[i].withdrawn += intent.amount;
            ch.info.withdraw_intent = None;
            Ok(vec![ChainEvent::ConfirmWithdraw {
                channel_id,
                receiver: intent.receiver,
                total_withdrawn: ch.info.funds[i].withdrawn,
            }])
        })
    }

    async fn veto_withdraw(&self, channel_id: ChannelId, vetoer: Address) -> Result<TxHash, ChainError> {
        self.submit(move |s| {
            let ch = s.channel(&channel_id)?;
            participant(&ch.info, &vetoer)?;
            let intent = ch.info.withdraw_intent.ok_or_else(|| fail("no pending withdraw"))?;
            if intent.receiver == vetoer {
                return Err(fail("cannot veto own withdraw"));
            }
            ch.info.withdraw_intent = None;
            Ok(vec![ChainEvent::VetoWithdraw { channel_id, vetoer }])
        })
    }

    async fn intend_settle(
        &self,
        submitter: Address,
        channel_id: ChannelId,
        states: Vec<SignedSimplexState>,
    ) -> Result<TxHash, ChainError> {
        if states.iter().any(|s| s.state.channel_id != channel_id) {
            return Err(ChainError::Rejected("state belongs to another channel".into()));
        }
        let window = self.config.dispute_window;
        self.submit(move |s| {
            let block = s.block;
            let ch = s.channel(&channel_id)?;
            participant(&ch.info, &submitter)?;
            match (ch.info.status, ch.info.settle_finalize_block) {
                (OnChainStatus::Closed, _) => return Err(fail("channel closed")),
                (OnChainStatus::Settling, Some(finalize)) if block >= finalize => {
                    return Err(fail("dispute window closed"))
                }
                _ => {}
            }
            let mut advanced = false;
            for signed in states {
                let from = participant(&ch.info, &signed.state.peer_from)?;
                verify_cosigned(&signed, &ch.keys[from], &ch.keys[1 - from]).map_err(|_| fail("bad state signature"))?;
                let current = ch.info.intended_seqs[from];
                if current.map_or(true, |seq| signed.state.seq_num > seq) {
                    ch.info.intended_seqs[from] = Some(signed.state.seq_num);
                    ch.intended[from] = Some(signed);
                    advanced = true;
                }
            }
            if !advanced && ch.info.status == OnChainStatus::Settling {
                return Err(fail("no newer state"));
            }
            ch.info.status = OnChainStatus::Settling;
            let finalize_block = *ch.info.settle_finalize_block.get_or_insert(block + window);
            Ok(vec![ChainEvent::IntendSettle {
                channel_id,
                submitter,
                seqs: ch.info.intended_seqs,
                finalize_block,
            }])
        })
    }

    async fn confirm_settle(&self, channel_id: ChannelId) -> Result<TxHash, ChainError> {
        self.submit(move |s| {
            let block = s.block;
            let Inner { channels, pays, .. } = s;
            let ch = channels
                .get_mut(&channel_id)
                .ok_or_else(|| fail("unknown channel"))?;
            if ch.info.status != OnChainStatus::Settling {
                return Err(fail("channel not settling"));
            }
            if ch.info.settle_finalize_block.is_some_and(|f| block < f) {
                return Err(fail("dispute window still open"));
            }
            let sent = [sent_by(ch.intended[0].as_ref(), pays), sent_by(ch.intended[1].as_ref(), pays)];
            let mut payouts = Vec::with_capacity(2);
            for i in 0..2 {
                let funds = ch.info.funds[i];
                let balance = (funds.deposit + sent[1 - i])
                    .checked_sub(funds.withdrawn + sent[i])
                    .ok_or_else(|| fail("settled balance negative"))?;
                ch.info.funds[i].withdrawn += balance;
                payouts.push(Payout {
                    receiver: ch.info.participants[i],
                    amount: balance,
                });
            }
            ch.info.status = OnChainStatus::Closed;
            Ok(vec![ChainEvent::ConfirmSettle { channel_id, payouts }])
        })
    }

    async fn resolve_payment_by_conditions(
        &self,
        pay: ConditionalPay,
        preimages: Vec<Vec<u8>>,
    ) -> Result<TxHash, ChainError> {
        self.submit(move |s| {
            if s.block > pay.resolve_deadline {
                return Err(fail("resolve deadline passed"));
            }
            let pay_id = pay.pay_id();
            if s.pays.contains_key(&pay_id) {
                return Err(fail("pay already resolved"));
            }
            let locks: Vec<_> = preimages.iter().map(|p| hash_lock(p)).collect();
            let outcomes: Vec<bool> = pay
                .conditions
                .iter()
                .map(|c| match c {
                    Condition::HashLock { hash } => locks.contains(hash),
                    other => s.outcomes.iter().any(|(k, v)| k == other && *v),
                })
                .collect();
            let amount = pay.resolved_amount(&outcomes);
            s.pays.insert(
                pay_id,
                PayInfo {
                    amount,
                    resolved_at: s.block,
                },
            );
            Ok(vec![ChainEvent::PayResolved { pay_id, amount }])
        })
    }

    async fn pay_info(&self, pay_id: PayId) -> Result<Option<PayInfo>, ChainError> {
        self.query(|s| s.pays.get(&pay_id).copied())
    }

    async fn query_condition(&self, condition: &Condition) -> Result<bool, ChainError> {
        self.query(|s| s.outcomes.iter().any(|(c, v)| c == condition && *v))
    }

    async fn migrate_channel(
        &self,
        channel_id: ChannelId,
        to_ledger: Address,
        states: Vec<SignedSimplexState>,
    ) -> Result<TxHash, ChainError> {
        self.submit(move |s| {
            let block = s.block;
            let (target, deadline) = s
                .migrations
                .get(&channel_id)
                .copied()
                .ok_or_else(|| fail("no migration announced"))?;
            if target != to_ledger {
                return Err(fail("migration target mismatch"));
            }
            if block > deadline {
                return Err(fail("migration deadline passed"));
            }
            let ch = s.channel(&channel_id)?;
            for signed in &states {
                let from = participant(&ch.info, &signed.state.peer_from)?;
                verify_cosigned(signed, &ch.keys[from], &ch.keys[1 - from]).map_err(|_| fail("bad state signature"))?;
            }
            ch.info.ledger = to_ledger;
            s.migrations.remove(&channel_id);
            Ok(vec![ChainEvent::ChannelMigrated {
                channel_id,
                ledger: to_ledger,
            }])
        })
    }

    async fn channel_info(&self, channel_id: ChannelId) -> Result<Option<ChannelInfo>, ChainError> {
        self.query(|s| s.channels.get(&channel_id).map(|c| c.info.clone()))
    }

    async fn receipt(&self, tx: TxHash) -> Result<Option<Receipt>, ChainError> {
        let mut s = self.lock()?;
        if let Some(err) = s.injected.pop_front() {
            return Err(err);
        }
        match s.txs.get_mut(&tx) {
            Some(entry) if entry.polls_left > 0 => {
                entry.polls_left -= 1;
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.receipt)),
            None => Ok(None),
        }
    }

    async fn logs_since(&self, from: u64, limit: usize) -> Result<(Vec<ChainLog>, u64), ChainError> {
        self.query(|s| {
            let start = (from as usize).min(s.logs.len());
            let logs: Vec<ChainLog> = s.logs[start..].iter().take(limit).cloned().collect();
            let next = start as u64 + logs.len() as u64;
            (logs, next)
        })
    }
}
