pub mod error;
pub mod types;
pub mod pay;
pub mod simplex;
pub mod state_machine;
pub mod records;
pub mod wire;

pub use error::CoreError;
pub use pay::{Condition, ConditionalPay, PayBuilder, TransferLogic};
pub use records::{
    CancelReason, Channel, ChannelStatus, ConfirmDecision, CrossNetRecord, MigrationRecord, MigrationState,
    OnChainFunds, PayLeg, PayRecord, PendingProposal, RelayDirection, SimplexEntry, UnconfirmedLeg, WithdrawJob,
    WithdrawJobStatus, WithdrawReservation,
};
pub use simplex::{PaySettlement, PendingPay, PendingPays, SignedSimplexState, SimplexState, StateChange};
pub use state_machine::{PayEvent, PayState, PayStateMachine};
pub use types::{Address, Amount, BlockNumber, ChannelId, Hash32, NetId, PayId, TokenInfo, TokenKind};
pub use wire::{Envelope, PeerMessage, PeerReply, RejectCode};
