use thiserror::Error;

/// Crate-wide error type. Every variant carries a stable numeric code; the
/// code is what appears in the `type` URI of problem+json responses, so codes
/// must never be reused or renumbered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("block already exists in storage")]
    BlockAlreadyExists,
    #[error("block not found")]
    BlockNotFound,
    #[error("account does not exist")]
    BlockAccountDoesNotExists,
    #[error("account already exists")]
    BlockAccountAlreadyExists,
    #[error("transaction sequence id does not match the source account")]
    TransactionInvalidSequenceID,
    #[error("transaction total exceeds the source balance")]
    TransactionExcessAbilityToPay,
    #[error("operation amount must be at least 1")]
    OperationAmountUnderflow,
    #[error("amount overflow")]
    AmountOverflow,
    #[error("amount underflow")]
    AmountUnderflow,
    #[error("signature verification failed")]
    SignatureVerificationFailed,
    #[error("hash does not match content")]
    HashDoesNotMatch,
    #[error("invalid fee: below base fee")]
    InvalidFee,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("transaction has no operations")]
    TransactionEmptyOperations,
    #[error("too many operations in transaction")]
    TransactionTooManyOperations,
    #[error("ballot is not well-formed: {0}")]
    BallotNotWellFormed(String),
    #[error("ballot voting already finished")]
    BallotAlreadyFinished,
    #[error("vote arrived for a stale phase")]
    BallotStalePhaseVote,
    #[error("voting result not found")]
    VotingResultNotFound,
    #[error("transaction not found")]
    TransactionNotFound,
    #[error("remote validator address mismatch")]
    AddressMismatch,
    #[error("storage record does not exist")]
    StorageRecordDoesNotExist,
    #[error("storage record already exists")]
    StorageRecordAlreadyExists,
    #[error("storage transaction conflict")]
    StorageTransactionConflict,
    #[error("network problem: {0}")]
    NetworkProblem(String),
    #[error("message is not well-formed: {0}")]
    MessageNotWellFormed(String),
}

impl Error {
    /// Stable numeric code, surfaced in problem+json `type` URIs.
    pub fn code(&self) -> u32 {
        match self {
            Error::BlockAlreadyExists => 100,
            Error::BlockNotFound => 101,
            Error::BlockAccountDoesNotExists => 102,
            Error::BlockAccountAlreadyExists => 103,
            Error::TransactionInvalidSequenceID => 104,
            Error::TransactionExcessAbilityToPay => 105,
            Error::OperationAmountUnderflow => 106,
            Error::AmountOverflow => 107,
            Error::AmountUnderflow => 108,
            Error::SignatureVerificationFailed => 109,
            Error::HashDoesNotMatch => 110,
            Error::InvalidFee => 111,
            Error::InvalidAddress(_) => 112,
            Error::InvalidEndpoint(_) => 113,
            Error::TransactionEmptyOperations => 114,
            Error::TransactionTooManyOperations => 115,
            Error::BallotNotWellFormed(_) => 116,
            Error::BallotAlreadyFinished => 117,
            Error::BallotStalePhaseVote => 118,
            Error::VotingResultNotFound => 119,
            Error::TransactionNotFound => 120,
            Error::AddressMismatch => 121,
            Error::StorageRecordDoesNotExist => 122,
            Error::StorageRecordAlreadyExists => 123,
            Error::StorageTransactionConflict => 124,
            Error::NetworkProblem(_) => 125,
            Error::MessageNotWellFormed(_) => 126,
        }
    }

    /// HTTP status used when the error is rendered as a problem document.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::BlockNotFound
            | Error::BlockAccountDoesNotExists
            | Error::StorageRecordDoesNotExist
            | Error::VotingResultNotFound
            | Error::TransactionNotFound => 404,
            Error::BlockAlreadyExists
            | Error::BlockAccountAlreadyExists
            | Error::StorageRecordAlreadyExists
            | Error::StorageTransactionConflict => 409,
            Error::NetworkProblem(_) => 502,
            _ => 400,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
