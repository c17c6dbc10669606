//! The authenticated balance state of one channel.
//!
//! A channel is two simplexes. The outgoing one carries value from us to the
//! peer and only we propose on it; the incoming one is proposed by the peer
//! and countersigned by us. At most one of our proposals is outstanding at a
//! time, so the committed seq of a simplex always advances by exactly one.

use chrono::Utc;
use osp_core::types::amount_str;
use osp_core::{
    Address, Amount, BlockNumber, Channel, ChannelId, ChannelStatus, ConditionalPay, OnChainFunds, PayId,
    PendingProposal, SignedSimplexState, SimplexEntry, SimplexState, StateChange, TokenInfo, UnconfirmedLeg,
    WithdrawReservation,
};
use osp_core::wire::StateProposal;
use osp_crypto::{sign_simplex, verify_cosigned, verify_simplex, KeyPair, PublicKey};
use osp_store::{Store, StoreBatch, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

/// Result of committing a cosigned state on the outgoing simplex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The state advanced; the change that produced it.
    Applied(StateChange),
    /// The state was already committed.
    AlreadyCommitted,
}

/// Result of countersigning a peer proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptOutcome {
    /// Our signature over the accepted state.
    pub sig: Vec<u8>,
    /// Seq of the incoming simplex before this proposal. The proposer had it
    /// cosigned, which proves every leg committed at or below it.
    pub prior_seq: u64,
    /// The proposal was the state we had already committed.
    pub replay: bool,
}

/// Read-only view of a channel for routing, policy and RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel_id: ChannelId,
    pub peer: Address,
    pub token: TokenInfo,
    pub status: ChannelStatus,
    pub ledger: Address,
    #[serde(with = "amount_str")]
    pub free_local: Amount,
    #[serde(with = "amount_str")]
    pub free_remote: Amount,
    #[serde(with = "amount_str")]
    pub locked_local: Amount,
    #[serde(with = "amount_str")]
    pub locked_remote: Amount,
    pub seq_out: u64,
    pub seq_in: u64,
    pub halted: Option<String>,
}

#[derive(Clone)]
pub struct ChannelLedger {
    channel: Channel,
    keypair: Arc<KeyPair>,
    peer_key: PublicKey,
}

impl ChannelLedger {
    pub fn new(channel: Channel, keypair: Arc<KeyPair>) -> Result<Self, LedgerError> {
        let peer_key = PublicKey::for_address(&channel.peer_key, &channel.peer)?;
        Ok(Self {
            channel,
            keypair,
            peer_key,
        })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.channel_id
    }

    pub fn peer(&self) -> Address {
        self.channel.peer
    }

    pub fn token(&self) -> TokenInfo {
        self.channel.token
    }

    pub fn peer_key(&self) -> &PublicKey {
        &self.peer_key
    }

    pub fn outgoing(&self) -> &SimplexEntry {
        &self.channel.outgoing
    }

    pub fn incoming(&self) -> &SimplexEntry {
        &self.channel.incoming
    }

    pub fn pending_proposal(&self) -> Option<&PendingProposal> {
        self.channel.pending_proposal.as_ref()
    }

    /// Balance `side` can still spend or withdraw.
    ///
    /// For our own side an outstanding proposal counts with whichever of the
    /// committed and proposed states locks more.
    pub fn free_balance(&self, side: Side) -> Result<Amount, LedgerError> {
        let committed = self.committed_free(side)?;
        match (side, &self.channel.pending_proposal) {
            (Side::Local, Some(pending)) => {
                let out = self.channel.outgoing.state();
                let committed_debit = add(out.transfer_to_peer, out.total_pending_amount)?;
                let proposed_debit = add(pending.state.transfer_to_peer, pending.state.total_pending_amount)?;
                let extra = proposed_debit.saturating_sub(committed_debit);
                Ok(committed.saturating_sub(extra))
            }
            _ => Ok(committed),
        }
    }

    fn committed_free(&self, side: Side) -> Result<Amount, LedgerError> {
        let c = &self.channel;
        let (funds, reservation, sent, received) = match side {
            Side::Local => (&c.local_funds, &c.local_withdraw, c.outgoing.state(), c.incoming.state()),
            Side::Remote => (&c.peer_funds, &c.peer_withdraw, c.incoming.state(), c.outgoing.state()),
        };
        let credit = add(funds.deposit, received.transfer_to_peer)?;
        let debit = [
            funds.withdrawn,
            sent.transfer_to_peer,
            sent.total_pending_amount,
            reservation.map(|r| r.amount).unwrap_or(0),
        ]
        .into_iter()
        .try_fold(0u128, add)?;
        credit.checked_sub(debit).ok_or_else(|| {
            LedgerError::InvariantViolation(format!(
                "{:?} balance negative on {}: credit {}, debit {}",
                side, c.channel_id, credit, debit
            ))
        })
    }

    /// Amount `side` has locked in pending pays.
    pub fn locked_amount(&self, side: Side) -> Amount {
        match side {
            Side::Local => self.channel.outgoing.state().total_pending_amount,
            Side::Remote => self.channel.incoming.state().total_pending_amount,
        }
    }

    pub fn summary(&self) -> ChannelSummary {
        let c = &self.channel;
        ChannelSummary {
            channel_id: c.channel_id,
            peer: c.peer,
            token: c.token,
            status: c.status,
            ledger: c.ledger,
            free_local: self.free_balance(Side::Local).unwrap_or(0),
            free_remote: self.free_balance(Side::Remote).unwrap_or(0),
            locked_local: self.locked_amount(Side::Local),
            locked_remote: self.locked_amount(Side::Remote),
            seq_out: c.outgoing.seq_num(),
            seq_in: c.incoming.seq_num(),
            halted: c.halted.clone(),
        }
    }

    fn ensure_usable(&self) -> Result<(), LedgerError> {
        if let Some(reason) = &self.channel.halted {
            return Err(LedgerError::ChannelHalted(reason.clone()));
        }
        if self.channel.status == ChannelStatus::Closed {
            return Err(LedgerError::ChannelNotOpen(ChannelStatus::Closed));
        }
        Ok(())
    }

    /// New pays need an open channel; settlements only need it not closed.
    fn ensure_accepts(&self, change: &StateChange) -> Result<(), LedgerError> {
        self.ensure_usable()?;
        match change {
            StateChange::AddPay { .. } | StateChange::DirectPay { .. } if self.channel.status != ChannelStatus::Opened => {
                Err(LedgerError::ChannelNotOpen(self.channel.status))
            }
            _ => Ok(()),
        }
    }

    /// Propose `new_state` as the successor of the committed outgoing state and
    /// sign it. The acceptance checks the peer will run are run here first.
    pub fn propose_state(
        &mut self,
        new_seq: u64,
        new_state: SimplexState,
        change: StateChange,
        pay: Option<ConditionalPay>,
        note: Option<String>,
    ) -> Result<Vec<u8>, LedgerError> {
        self.ensure_accepts(&change)?;
        if self.channel.pending_proposal.is_some() {
            return Err(LedgerError::ProposalOutstanding(self.channel.channel_id));
        }
        let expected_seq = self.channel.outgoing.seq_num() + 1;
        if new_seq != expected_seq || new_state.seq_num != new_seq {
            return Err(LedgerError::StaleSeqNum {
                expected: expected_seq,
                got: new_seq,
            });
        }
        let (computed, _) = self
            .channel
            .outgoing
            .state()
            .apply(&change, &self.channel.outgoing.pending_pays)?;
        if computed != new_state {
            return Err(LedgerError::StateMismatch(format!("seq {} does not follow from change", new_seq)));
        }
        if let StateChange::AddPay { amount, .. } | StateChange::DirectPay { amount, .. } = &change {
            let available = self.free_balance(Side::Local)?;
            if available < *amount {
                return Err(LedgerError::InsufficientBalance {
                    available,
                    required: *amount,
                });
            }
        }

        let sig = sign_simplex(&new_state, &self.keypair);
        tracing::debug!(channel = %self.channel.channel_id.short(), seq = new_seq, "proposed outgoing state");
        self.channel.pending_proposal = Some(PendingProposal {
            state: new_state,
            change,
            sig: sig.clone(),
            pay,
            note,
            created_at: Utc::now(),
        });
        Ok(sig)
    }

    /// Compute, sign and record the proposal for `change`.
    pub fn prepare_proposal(
        &mut self,
        change: StateChange,
        pay: Option<ConditionalPay>,
        note: Option<String>,
    ) -> Result<StateProposal, LedgerError> {
        let (state, _) = self
            .channel
            .outgoing
            .state()
            .apply(&change, &self.channel.outgoing.pending_pays)?;
        let sig = self.propose_state(state.seq_num, state.clone(), change.clone(), pay, note)?;
        Ok(StateProposal { state, change, sig })
    }

    /// The outstanding proposal as it goes on the wire.
    pub fn pending_wire_proposal(&self) -> Option<StateProposal> {
        self.channel.pending_proposal.as_ref().map(|p| StateProposal {
            state: p.state.clone(),
            change: p.change.clone(),
            sig: p.sig.clone(),
        })
    }

    /// Commit a cosigned outgoing state. It must be our outstanding proposal,
    /// or the state already committed.
    pub fn commit_state(&mut self, signed: SignedSimplexState) -> Result<CommitOutcome, LedgerError> {
        self.ensure_usable()?;
        if signed.state.peer_from != self.channel.local {
            return Err(LedgerError::StateMismatch("only the outgoing simplex is committed by cosign".into()));
        }
        let committed = &self.channel.outgoing;
        if signed.state == *committed.state() && committed.signed.is_cosigned() {
            return Ok(CommitOutcome::AlreadyCommitted);
        }
        if signed.state.seq_num <= committed.seq_num() {
            return Err(LedgerError::StaleSeqNum {
                expected: committed.seq_num() + 1,
                got: signed.state.seq_num,
            });
        }
        let pending = self
            .channel
            .pending_proposal
            .as_ref()
            .ok_or(LedgerError::NoPendingProposal)?;
        if pending.state != signed.state {
            return Err(LedgerError::StateMismatch(format!(
                "cosigned seq {} is not the outstanding proposal",
                signed.state.seq_num
            )));
        }
        verify_cosigned(&signed, &self.keypair.public_key(), &self.peer_key)?;
        let (_, pending_pays) = committed.state().apply(&pending.change, &committed.pending_pays)?;
        let change = pending.change.clone();

        self.channel.outgoing = SimplexEntry { signed, pending_pays };
        self.channel.pending_proposal = None;
        tracing::debug!(
            channel = %self.channel.channel_id.short(),
            seq = self.channel.outgoing.seq_num(),
            "committed outgoing state"
        );
        Ok(CommitOutcome::Applied(change))
    }

    /// Commit our outstanding proposal with the peer's countersignature.
    pub fn commit_with_peer_sig(&mut self, peer_sig: Vec<u8>) -> Result<CommitOutcome, LedgerError> {
        let pending = self
            .channel
            .pending_proposal
            .as_ref()
            .ok_or(LedgerError::NoPendingProposal)?;
        let signed = SignedSimplexState {
            state: pending.state.clone(),
            sig_of_peer_from: pending.sig.clone(),
            sig_of_peer_to: peer_sig,
        };
        self.commit_state(signed)
    }

    /// Drop the outstanding proposal after the peer refused it.
    pub fn abort_pending(&mut self) -> Option<PendingProposal> {
        let aborted = self.channel.pending_proposal.take();
        if let Some(p) = &aborted {
            tracing::debug!(channel = %self.channel.channel_id.short(), seq = p.state.seq_num, "aborted proposal");
        }
        aborted
    }

    /// Validate and countersign the peer's proposal, committing it on the
    /// incoming simplex.
    pub fn accept_state(&mut self, proposal: &StateProposal) -> Result<AcceptOutcome, LedgerError> {
        self.ensure_accepts(&proposal.change)?;
        let committed = &self.channel.incoming;
        if proposal.state.peer_from != self.channel.peer || proposal.state.channel_id != self.channel.channel_id {
            return Err(LedgerError::StateMismatch("proposal is not for our incoming simplex".into()));
        }
        if proposal.state == *committed.state() && committed.signed.sig_of_peer_from == proposal.sig {
            return Ok(AcceptOutcome {
                sig: committed.signed.sig_of_peer_to.clone(),
                prior_seq: committed.seq_num().saturating_sub(1),
                replay: true,
            });
        }
        let expected_seq = committed.seq_num() + 1;
        if proposal.state.seq_num != expected_seq {
            return Err(LedgerError::StaleSeqNum {
                expected: expected_seq,
                got: proposal.state.seq_num,
            });
        }
        verify_simplex(&proposal.state, &proposal.sig, &self.peer_key)?;
        let (computed, pending_pays) = committed.state().apply(&proposal.change, &committed.pending_pays)?;
        if computed != proposal.state {
            return Err(LedgerError::StateMismatch(format!(
                "seq {} does not follow from change",
                proposal.state.seq_num
            )));
        }
        if let StateChange::AddPay { amount, .. } | StateChange::DirectPay { amount, .. } = &proposal.change {
            let available = self.free_balance(Side::Remote)?;
            if available < *amount {
                return Err(LedgerError::InsufficientBalance {
                    available,
                    required: *amount,
                });
            }
        }

        let prior_seq = committed.seq_num();
        let sig = sign_simplex(&proposal.state, &self.keypair);
        self.channel.incoming = SimplexEntry {
            signed: SignedSimplexState {
                state: proposal.state.clone(),
                sig_of_peer_from: proposal.sig.clone(),
                sig_of_peer_to: sig.clone(),
            },
            pending_pays,
        };
        tracing::debug!(channel = %self.channel.channel_id.short(), seq = expected_seq, "accepted incoming state");
        Ok(AcceptOutcome {
            sig,
            prior_seq,
            replay: false,
        })
    }

    /// Adopt a cosigned incoming state the peer holds but we do not, e.g.
    /// after restoring from an older backup. Only states newer than ours that
    /// carry both signatures and a consistent lock table are taken.
    pub fn adopt_incoming(&mut self, entry: &SimplexEntry) -> Result<bool, LedgerError> {
        if entry.seq_num() <= self.channel.incoming.seq_num() {
            return Ok(false);
        }
        if entry.state().channel_id != self.channel.channel_id {
            return Err(LedgerError::StateMismatch("state belongs to another channel".into()));
        }
        verify_cosigned(&entry.signed, &self.peer_key, &self.keypair.public_key())?;
        check_lock_table(entry)?;
        tracing::warn!(
            channel = %self.channel.channel_id.short(),
            from = self.channel.incoming.seq_num(),
            to = entry.seq_num(),
            "adopted newer incoming state from peer"
        );
        self.channel.incoming = entry.clone();
        Ok(true)
    }

    /// Adopt a cosigned outgoing state newer than ours that the peer proves we
    /// signed. Any pending proposal at or below the adopted seq is dropped.
    pub fn adopt_outgoing(&mut self, entry: &SimplexEntry) -> Result<bool, LedgerError> {
        if entry.seq_num() <= self.channel.outgoing.seq_num() {
            return Ok(false);
        }
        if entry.state().channel_id != self.channel.channel_id || entry.state().peer_from != self.channel.local {
            return Err(LedgerError::StateMismatch("state is not our outgoing simplex".into()));
        }
        verify_cosigned(&entry.signed, &self.keypair.public_key(), &self.peer_key)?;
        check_lock_table(entry)?;
        tracing::warn!(
            channel = %self.channel.channel_id.short(),
            from = self.channel.outgoing.seq_num(),
            to = entry.seq_num(),
            "adopted newer outgoing state from peer"
        );
        self.channel.outgoing = entry.clone();
        if self
            .channel
            .pending_proposal
            .as_ref()
            .is_some_and(|p| p.state.seq_num <= entry.seq_num())
        {
            self.channel.pending_proposal = None;
        }
        Ok(true)
    }

    pub fn track_unconfirmed(&mut self, pay_id: PayId, seq: u64) {
        if !self.channel.unconfirmed.iter().any(|l| l.pay_id == pay_id) {
            self.channel.unconfirmed.push(UnconfirmedLeg {
                pay_id,
                seq,
                since: Utc::now(),
            });
        }
    }

    /// When the longest-waiting unconfirmed incoming leg was committed.
    pub fn oldest_unconfirmed(&self) -> Option<chrono::DateTime<Utc>> {
        self.channel.unconfirmed.iter().map(|l| l.since).min()
    }

    /// Remove and return incoming legs committed at or below `seq`.
    pub fn take_confirmed(&mut self, seq: u64) -> Vec<PayId> {
        let (confirmed, rest): (Vec<_>, Vec<_>) = self.channel.unconfirmed.drain(..).partition(|l| l.seq <= seq);
        self.channel.unconfirmed = rest;
        confirmed.into_iter().map(|l| l.pay_id).collect()
    }

    pub fn drop_unconfirmed(&mut self, pay_id: &PayId) {
        self.channel.unconfirmed.retain(|l| &l.pay_id != pay_id);
    }

    /// Pending pays locked toward us whose deadline is at or before `block`.
    pub fn incoming_pays_due(&self, block: BlockNumber) -> Vec<PayId> {
        due(&self.channel.incoming, block)
    }

    /// Pending pays we locked whose deadline is before `block`.
    pub fn outgoing_pays_expired(&self, block: BlockNumber) -> Vec<PayId> {
        self.channel
            .outgoing
            .pending_pays
            .iter()
            .filter(|(_, p)| p.resolve_deadline < block)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Overwrite on-chain funds with the values read from chain.
    pub fn set_onchain_funds(&mut self, local: OnChainFunds, peer: OnChainFunds) {
        self.channel.local_funds = local;
        self.channel.peer_funds = peer;
    }

    pub fn next_withdraw_seq(&self) -> u64 {
        self.channel.withdraw_seq + 1
    }

    /// Align the cooperative-withdraw counter with the chain.
    pub fn set_withdraw_seq(&mut self, seq: u64) {
        self.channel.withdraw_seq = seq;
    }

    /// Set aside `amount` of `side`'s free balance for a withdrawal in flight.
    pub fn reserve_withdraw(
        &mut self,
        side: Side,
        amount: Amount,
        seq: u64,
        deadline: BlockNumber,
    ) -> Result<(), LedgerError> {
        self.ensure_usable()?;
        let slot = match side {
            Side::Local => &self.channel.local_withdraw,
            Side::Remote => &self.channel.peer_withdraw,
        };
        if slot.is_some() {
            return Err(LedgerError::ProposalOutstanding(self.channel.channel_id));
        }
        if seq <= self.channel.withdraw_seq {
            return Err(LedgerError::StaleSeqNum {
                expected: self.channel.withdraw_seq + 1,
                got: seq,
            });
        }
        let available = self.free_balance(side)?;
        if available < amount {
            return Err(LedgerError::InsufficientBalance {
                available,
                required: amount,
            });
        }
        let reservation = Some(WithdrawReservation { amount, seq, deadline });
        match side {
            Side::Local => self.channel.local_withdraw = reservation,
            Side::Remote => self.channel.peer_withdraw = reservation,
        }
        self.channel.withdraw_seq = seq;
        Ok(())
    }

    pub fn release_withdraw(&mut self, side: Side) -> Option<WithdrawReservation> {
        match side {
            Side::Local => self.channel.local_withdraw.take(),
            Side::Remote => self.channel.peer_withdraw.take(),
        }
    }

    /// Release reservations whose deadline passed without a withdrawal.
    pub fn expire_reservations(&mut self, block: BlockNumber) -> bool {
        let mut changed = false;
        for slot in [&mut self.channel.local_withdraw, &mut self.channel.peer_withdraw] {
            if slot.is_some_and(|r| r.deadline < block) {
                *slot = None;
                changed = true;
            }
        }
        changed
    }

    pub fn set_status(&mut self, status: ChannelStatus) {
        self.channel.status = status;
    }

    pub fn set_settle_finalize_block(&mut self, block: Option<BlockNumber>) {
        self.channel.settle_finalize_block = block;
    }

    pub fn set_ledger(&mut self, ledger: Address) {
        self.channel.ledger = ledger;
    }

    pub fn halt(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(channel = %self.channel.channel_id, reason = %reason, "channel halted");
        self.channel.halted = Some(reason);
    }

    /// Neither side's balance may be negative, and both simplexes must agree
    /// with their lock tables.
    pub fn check_invariants(&self) -> Result<(), LedgerError> {
        self.committed_free(Side::Local)?;
        self.committed_free(Side::Remote)?;
        for (name, entry) in [("outgoing", &self.channel.outgoing), ("incoming", &self.channel.incoming)] {
            let locked = entry
                .pending_pays
                .values()
                .map(|p| p.amount)
                .try_fold(0u128, add)?;
            if locked != entry.state().total_pending_amount
                || entry.pending_pays.len() != entry.state().pending_pay_ids.len()
            {
                return Err(LedgerError::InvariantViolation(format!(
                    "{} lock table disagrees with state on {}",
                    name, self.channel.channel_id
                )));
            }
        }
        Ok(())
    }

    /// Run `f` on a copy of this ledger and persist the copy together with
    /// everything `f` added to the batch. The ledger only changes if the write
    /// succeeds. A copy that breaks the balance invariants halts the channel.
    pub fn transact<T, E, F>(&mut self, store: &dyn Store, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut ChannelLedger, &mut StoreBatch) -> Result<T, E>,
        E: From<LedgerError> + From<StoreError>,
    {
        let mut draft = self.clone();
        let mut batch = StoreBatch::new();
        let out = f(&mut draft, &mut batch)?;

        if let Err(violation) = draft.check_invariants() {
            self.halt(violation.to_string());
            let mut halt = StoreBatch::new();
            halt.put_channel(self.channel.clone());
            if let Err(e) = store.write(halt) {
                tracing::error!(channel = %self.channel.channel_id, error = %e, "failed to persist halt");
            }
            return Err(E::from(violation));
        }

        batch.put_channel(draft.channel.clone());
        store.write(batch)?;
        *self = draft;
        Ok(out)
    }
}

fn add(a: Amount, b: Amount) -> Result<Amount, LedgerError> {
    a.checked_add(b)
        .ok_or_else(|| LedgerError::InvariantViolation("amount overflow".into()))
}

fn check_lock_table(entry: &SimplexEntry) -> Result<(), LedgerError> {
    let locked = entry.pending_pays.values().map(|p| p.amount).try_fold(0u128, add)?;
    let ids_match = entry.pending_pays.len() == entry.state().pending_pay_ids.len()
        && entry.state().pending_pay_ids.iter().all(|id| entry.pending_pays.contains_key(id));
    if locked != entry.state().total_pending_amount || !ids_match {
        return Err(LedgerError::StateMismatch("lock table does not match the signed state".into()));
    }
    Ok(())
}

fn due(entry: &SimplexEntry, block: BlockNumber) -> Vec<PayId> {
    entry
        .pending_pays
        .iter()
        .filter(|(_, p)| p.resolve_deadline <= block)
        .map(|(id, _)| *id)
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use osp_core::PaySettlement;
    use osp_store::MemoryStore;

    pub const DEPOSIT: Amount = 5_000_000_000_000_000_000;

    /// Two ledgers for the same channel, one per participant.
    pub fn pair() -> (ChannelLedger, ChannelLedger) {
        let ka = Arc::new(KeyPair::from_seed(&[1; 32]));
        let kb = Arc::new(KeyPair::from_seed(&[2; 32]));
        let cid = ChannelId([9; 32]);
        let funds = OnChainFunds {
            deposit: DEPOSIT,
            withdrawn: 0,
        };
        let mut ca = Channel::new(
            cid,
            TokenInfo::native(),
            ka.address(),
            kb.address(),
            kb.public_key().to_vec(),
            Address([7; 20]),
        );
        ca.local_funds = funds;
        ca.peer_funds = funds;
        let mut cb = Channel::new(
            cid,
            TokenInfo::native(),
            kb.address(),
            ka.address(),
            ka.public_key().to_vec(),
            Address([7; 20]),
        );
        cb.local_funds = funds;
        cb.peer_funds = funds;
        (ChannelLedger::new(ca, ka).unwrap(), ChannelLedger::new(cb, kb).unwrap())
    }

    fn add_pay(id: u8, amount: Amount) -> StateChange {
        StateChange::AddPay {
            pay_id: PayId([id; 32]),
            amount,
            resolve_deadline: 10,
        }
    }

    /// Full round trip: a proposes, b accepts, a commits.
    fn exchange(a: &mut ChannelLedger, b: &mut ChannelLedger, change: StateChange) -> AcceptOutcome {
        let proposal = a.prepare_proposal(change, None, None).unwrap();
        let outcome = b.accept_state(&proposal).unwrap();
        a.commit_with_peer_sig(outcome.sig.clone()).unwrap();
        outcome
    }

    #[test]
    fn test_basic_direct_pay_moves_one_unit() {
        let (mut a, mut b) = pair();
        exchange(
            &mut a,
            &mut b,
            StateChange::DirectPay {
                pay_id: PayId([1; 32]),
                amount: 1,
            },
        );
        assert_eq!(a.free_balance(Side::Local).unwrap(), DEPOSIT - 1);
        assert_eq!(a.free_balance(Side::Remote).unwrap(), DEPOSIT + 1);
        assert_eq!(b.free_balance(Side::Local).unwrap(), DEPOSIT + 1);
        assert_eq!(b.free_balance(Side::Remote).unwrap(), DEPOSIT - 1);
        assert_eq!(a.outgoing().seq_num(), 1);
        assert_eq!(b.incoming().seq_num(), 1);
    }

    #[test]
    fn test_balance_conserved_through_lock_and_settle() {
        let (mut a, mut b) = pair();
        exchange(&mut a, &mut b, add_pay(1, 100));
        let total = |l: &ChannelLedger| {
            l.free_balance(Side::Local).unwrap()
                + l.free_balance(Side::Remote).unwrap()
                + l.locked_amount(Side::Local)
                + l.locked_amount(Side::Remote)
        };
        assert_eq!(total(&a), 2 * DEPOSIT);
        assert_eq!(a.locked_amount(Side::Local), 100);

        exchange(
            &mut a,
            &mut b,
            StateChange::SettlePays {
                settlements: vec![PaySettlement {
                    pay_id: PayId([1; 32]),
                    amount: 40,
                }],
            },
        );
        assert_eq!(total(&a), 2 * DEPOSIT);
        assert_eq!(total(&b), 2 * DEPOSIT);
        assert_eq!(b.free_balance(Side::Local).unwrap(), DEPOSIT + 40);
        assert_eq!(a.locked_amount(Side::Local), 0);
    }

    #[test]
    fn test_stale_seq_rejected_without_change() {
        let (mut a, mut b) = pair();
        let first = a.prepare_proposal(add_pay(1, 5), None, None).unwrap();
        let out = b.accept_state(&first).unwrap();
        a.commit_with_peer_sig(out.sig).unwrap();

        let before = b.channel().clone();
        let mut stale = first.clone();
        stale.change = add_pay(2, 5);
        assert!(matches!(b.accept_state(&stale), Err(LedgerError::StaleSeqNum { expected: 2, got: 1 })));
        assert_eq!(b.channel(), &before);
    }

    #[test]
    fn test_accept_replay_returns_same_signature() {
        let (mut a, mut b) = pair();
        let proposal = a.prepare_proposal(add_pay(1, 5), None, None).unwrap();
        let first = b.accept_state(&proposal).unwrap();
        let again = b.accept_state(&proposal).unwrap();
        assert!(again.replay);
        assert_eq!(first.sig, again.sig);
        assert_eq!(b.incoming().seq_num(), 1);
    }

    #[test]
    fn test_tampered_state_rejected() {
        let (mut a, mut b) = pair();
        let mut proposal = a.prepare_proposal(add_pay(1, 5), None, None).unwrap();
        proposal.state.transfer_to_peer = 1_000;
        assert!(matches!(b.accept_state(&proposal), Err(LedgerError::Crypto(_))));
        assert_eq!(b.incoming().seq_num(), 0);
    }

    #[test]
    fn test_overspend_rejected() {
        let (mut a, _) = pair();
        let result = a.prepare_proposal(add_pay(1, DEPOSIT + 1), None, None);
        assert!(matches!(result, Err(LedgerError::InsufficientBalance { .. })));
        assert!(a.pending_proposal().is_none());
    }

    #[test]
    fn test_single_outstanding_proposal() {
        let (mut a, _) = pair();
        a.prepare_proposal(add_pay(1, 5), None, None).unwrap();
        let second = a.prepare_proposal(add_pay(2, 5), None, None);
        assert!(matches!(second, Err(LedgerError::ProposalOutstanding(_))));
        assert_eq!(a.free_balance(Side::Local).unwrap(), DEPOSIT - 5);
        a.abort_pending();
        assert_eq!(a.free_balance(Side::Local).unwrap(), DEPOSIT);
    }

    #[test]
    fn test_commit_is_idempotent() {
        let (mut a, mut b) = pair();
        let proposal = a.prepare_proposal(add_pay(1, 5), None, None).unwrap();
        let out = b.accept_state(&proposal).unwrap();
        a.commit_with_peer_sig(out.sig.clone()).unwrap();
        let signed = a.outgoing().signed.clone();
        assert_eq!(a.commit_state(signed).unwrap(), CommitOutcome::AlreadyCommitted);
    }

    #[test]
    fn test_commit_rejects_bad_countersignature() {
        let (mut a, _) = pair();
        a.prepare_proposal(add_pay(1, 5), None, None).unwrap();
        let result = a.commit_with_peer_sig(vec![0; 64]);
        assert!(result.is_err());
        assert_eq!(a.outgoing().seq_num(), 0);
        assert!(a.pending_proposal().is_some());
    }

    #[test]
    fn test_unconfirmed_legs_confirm_by_seq() {
        let (_, mut b) = pair();
        b.track_unconfirmed(PayId([1; 32]), 1);
        b.track_unconfirmed(PayId([2; 32]), 2);
        assert!(b.take_confirmed(0).is_empty());
        assert_eq!(b.take_confirmed(1), vec![PayId([1; 32])]);
        assert_eq!(b.take_confirmed(5), vec![PayId([2; 32])]);
    }

    #[test]
    fn test_oldest_unconfirmed_tracks_waiting_legs() {
        let (_, mut b) = pair();
        assert!(b.oldest_unconfirmed().is_none());
        let before = Utc::now();
        b.track_unconfirmed(PayId([1; 32]), 1);
        b.track_unconfirmed(PayId([2; 32]), 2);
        let oldest = b.oldest_unconfirmed().expect("two legs wait");
        assert!(oldest >= before && oldest <= Utc::now());
        b.drop_unconfirmed(&PayId([1; 32]));
        b.drop_unconfirmed(&PayId([2; 32]));
        assert!(b.oldest_unconfirmed().is_none());
    }

    #[test]
    fn test_withdraw_reservation_limits_spending() {
        let (mut a, _) = pair();
        a.reserve_withdraw(Side::Local, DEPOSIT - 10, 1, 50).unwrap();
        assert_eq!(a.free_balance(Side::Local).unwrap(), 10);
        assert!(a.prepare_proposal(add_pay(1, 11), None, None).is_err());
        assert!(a.reserve_withdraw(Side::Local, 1, 2, 50).is_err());
        assert!(a.expire_reservations(51));
        assert_eq!(a.free_balance(Side::Local).unwrap(), DEPOSIT);
    }

    #[test]
    fn test_transact_persists_or_leaves_untouched() {
        let (mut a, _) = pair();
        let store = MemoryStore::new();
        let result: Result<(), LedgerError> = a.transact(&store, |l, _| {
            l.prepare_proposal(add_pay(1, 5), None, None)?;
            Err(LedgerError::NoPendingProposal)
        });
        assert!(result.is_err());
        assert!(a.pending_proposal().is_none());
        assert!(store.get_channel(&a.channel_id()).unwrap().is_none());

        a.transact::<_, LedgerError, _>(&store, |l, _| l.prepare_proposal(add_pay(1, 5), None, None))
            .unwrap();
        let saved = store.get_channel(&a.channel_id()).unwrap().unwrap();
        assert!(saved.pending_proposal.is_some());
    }

    #[test]
    fn test_invariant_violation_halts_channel() {
        let (mut a, _) = pair();
        let store = MemoryStore::new();
        let result: Result<(), LedgerError> = a.transact(&store, |l, _| {
            l.set_onchain_funds(
                OnChainFunds {
                    deposit: 1,
                    withdrawn: 2,
                },
                OnChainFunds::default(),
            );
            Ok(())
        });
        assert!(matches!(result, Err(LedgerError::InvariantViolation(_))));
        assert!(a.channel().halted.is_some());
        assert!(store.get_channel(&a.channel_id()).unwrap().unwrap().halted.is_some());
        assert!(matches!(
            a.prepare_proposal(add_pay(1, 1), None, None),
            Err(LedgerError::ChannelHalted(_))
        ));
    }

    #[test]
    fn test_settling_channel_refuses_new_pays() {
        let (mut a, mut b) = pair();
        exchange(&mut a, &mut b, add_pay(1, 5));
        a.set_status(ChannelStatus::Settling);
        assert!(matches!(
            a.prepare_proposal(add_pay(2, 1), None, None),
            Err(LedgerError::ChannelNotOpen(_))
        ));
        let settle = StateChange::SettlePays {
            settlements: vec![PaySettlement {
                pay_id: PayId([1; 32]),
                amount: 0,
            }],
        };
        assert!(a.prepare_proposal(settle, None, None).is_ok());
    }

    #[test]
    fn test_adopt_incoming_requires_both_signatures() {
        let (mut a, mut b) = pair();
        let proposal = a.prepare_proposal(add_pay(1, 5), None, None).unwrap();
        let out = b.accept_state(&proposal).unwrap();
        a.commit_with_peer_sig(out.sig).unwrap();

        let (_, mut fresh_b) = pair();
        let entry = a.outgoing().clone();
        assert!(fresh_b.adopt_incoming(&entry).unwrap());
        assert_eq!(fresh_b.incoming(), b.incoming());
        assert!(!fresh_b.adopt_incoming(&entry).unwrap());

        let mut unsigned = entry.clone();
        unsigned.signed.sig_of_peer_to.clear();
        let (_, mut other) = pair();
        assert!(other.adopt_incoming(&unsigned).is_err());
    }

    #[test]
    fn test_adopt_outgoing_clears_covered_proposal() {
        let (mut a, mut b) = pair();
        let (mut restored_a, _) = pair();
        let proposal = a.prepare_proposal(add_pay(1, 5), None, None).unwrap();
        b.accept_state(&proposal).unwrap();

        // The restored copy re-proposes the same seq; the peer's cosigned
        // incoming state supersedes it.
        restored_a.prepare_proposal(add_pay(1, 5), None, None).unwrap();
        let entry = b.incoming().clone();
        assert!(restored_a.adopt_outgoing(&entry).unwrap());
        assert_eq!(restored_a.outgoing().seq_num(), 1);
        assert!(restored_a.pending_proposal().is_none());
        assert_eq!(restored_a.locked_amount(Side::Local), 5);
        assert!(!restored_a.adopt_outgoing(&entry).unwrap());

        // The peer's own outgoing simplex is never adopted as ours.
        let (_, mut other_b) = pair();
        assert!(other_b.adopt_outgoing(&entry).is_err());
    }
}
