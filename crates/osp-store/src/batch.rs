use osp_core::{Channel, ChannelId, CrossNetRecord, Hash32, MigrationRecord, PayRecord, WithdrawJob};

/// A single write inside a [`StoreBatch`].
#[derive(Debug, Clone)]
pub enum WriteOp {
    PutChannel(Box<Channel>),
    PutPay(Box<PayRecord>),
    PutCrossNet(CrossNetRecord),
    PutMigration(MigrationRecord),
    DeleteMigration(ChannelId),
    PutWithdrawJob(WithdrawJob),
    PutSecret { hash: Hash32, preimage: Vec<u8> },
    PutMeta { key: String, value: Vec<u8> },
}

/// Writes applied all-or-nothing. A ledger commit and the pay transitions it
/// causes always travel in the same batch.
#[derive(Debug, Clone, Default)]
pub struct StoreBatch {
    ops: Vec<WriteOp>,
}

impl StoreBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_channel(&mut self, channel: Channel) -> &mut Self {
        self.ops.push(WriteOp::PutChannel(Box::new(channel)));
        self
    }

    pub fn put_pay(&mut self, record: PayRecord) -> &mut Self {
        self.ops.push(WriteOp::PutPay(Box::new(record)));
        self
    }

    pub fn put_cross_net(&mut self, record: CrossNetRecord) -> &mut Self {
        self.ops.push(WriteOp::PutCrossNet(record));
        self
    }

    pub fn put_migration(&mut self, record: MigrationRecord) -> &mut Self {
        self.ops.push(WriteOp::PutMigration(record));
        self
    }

    pub fn delete_migration(&mut self, channel_id: ChannelId) -> &mut Self {
        self.ops.push(WriteOp::DeleteMigration(channel_id));
        self
    }

    pub fn put_withdraw_job(&mut self, job: WithdrawJob) -> &mut Self {
        self.ops.push(WriteOp::PutWithdrawJob(job));
        self
    }

    pub fn put_secret(&mut self, hash: Hash32, preimage: Vec<u8>) -> &mut Self {
        self.ops.push(WriteOp::PutSecret { hash, preimage });
        self
    }

    pub fn put_meta(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.ops.push(WriteOp::PutMeta {
            key: key.into(),
            value,
        });
        self
    }

    /// Append every op of `other`.
    pub fn extend(&mut self, other: StoreBatch) -> &mut Self {
        self.ops.extend(other.ops);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}
