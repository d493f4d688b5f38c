//! Error types for vaultsync

use thiserror::Error;

/// Main error type for vault operations
#[derive(Error, Debug)]
pub enum VaultError {
    /// The identifier is not a 64-character hex public key
    #[error("Invalid vault key: {0}")]
    InvalidVaultKey(String),

    /// A name could not be resolved to a vault key
    #[error("Invalid domain name: {0}")]
    InvalidDomainName(String),

    /// Mutation attempted without the secret key, or against a checkout
    #[error("Vault is not writable")]
    VaultNotWritable,

    /// Path does not exist (or its content has not been downloaded)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Path exists but is not a directory
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// Reserved manifest path or disallowed OS path
    #[error("Protected path is not writable: {0}")]
    ProtectedPathNotWritable(String),

    /// Binary content where text was expected
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    /// File exceeds the diff size ceiling
    #[error("Source too large: {size} bytes exceeds the {limit} byte limit")]
    SourceTooLarge {
        /// Size of the offending file
        size: u64,
        /// The enforced ceiling
        limit: u64,
    },

    /// A write would push the vault past its byte budget
    #[error("Quota exceeded: {needed} bytes needed, {quota} byte quota")]
    QuotaExceeded {
        /// Bytes the vault would occupy after the write
        needed: u64,
        /// The configured budget
        quota: u64,
    },

    /// A structural cycle (e.g. a symlink loop) was found while walking a folder
    #[error("Filesystem cycle detected at {0}")]
    FilesystemCycle(String),

    /// A deduplicated load failed; carries the original store error detail
    #[error("Vault load failed: {0}")]
    Load(String),

    /// Signature verification failed on a replicated log entry
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// Error during storage operations
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// Error during gossip protocol operations
    #[error("Gossip error: {0}")]
    Gossip(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VaultError {
    /// Stable machine-readable kind, for hosts that translate errors
    /// into user-facing messages.
    pub fn kind(&self) -> &'static str {
        match self {
            VaultError::InvalidVaultKey(_) => "invalid-vault-key",
            VaultError::InvalidDomainName(_) => "invalid-domain-name",
            VaultError::VaultNotWritable => "vault-not-writable",
            VaultError::NotFound(_) => "not-found",
            VaultError::NotADirectory(_) => "not-a-directory",
            VaultError::ProtectedPathNotWritable(_) => "protected-path-not-writable",
            VaultError::InvalidEncoding(_) => "invalid-encoding",
            VaultError::SourceTooLarge { .. } => "source-too-large",
            VaultError::QuotaExceeded { .. } => "quota-exceeded",
            VaultError::FilesystemCycle(_) => "filesystem-cycle",
            VaultError::Load(_) => "load-failed",
            VaultError::SignatureInvalid(_) => "signature-invalid",
            VaultError::Storage(_)
            | VaultError::Database(_)
            | VaultError::Transaction(_)
            | VaultError::Table(_)
            | VaultError::StorageOp(_)
            | VaultError::Commit(_) => "storage",
            VaultError::Serialization(_) => "serialization",
            VaultError::Network(_) => "network",
            VaultError::Gossip(_) => "gossip",
            VaultError::Io(_) => "io",
        }
    }
}

/// Result type alias using VaultError
pub type VaultResult<T> = Result<T, VaultError>;
