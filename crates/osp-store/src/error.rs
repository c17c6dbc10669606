/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("rocksdb error: {0}")]
    Rocks(#[from] rocksdb::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("column family '{0}' not found")]
    MissingColumnFamily(&'static str),

    #[error("corrupt key in {0}")]
    CorruptKey(&'static str),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
