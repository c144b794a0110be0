use thiserror::Error;

use crate::types::BetId;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("transaction record is {0} bytes, the limit is 64")]
    RecordTooLong(usize),
    #[error("malformed transaction record: {0}")]
    MalformedRecord(String),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("expiration must lie in the future")]
    InvalidExpiration,
    #[error("bet {0} is not open")]
    BetNotOpen(BetId),
    #[error("malformed block: {0}")]
    MalformedBlock(&'static str),
    #[error("block does not extend the current tip")]
    PrevHashMismatch,
    #[error("block header does not meet the difficulty target")]
    InsufficientWork,
    #[error("unknown message type {0}")]
    UnknownMessageType(u32),
    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),
    #[error("payload of {0} bytes cannot be framed")]
    FrameTooLarge(usize),
    #[error("empty payloads are reserved for liveness probes")]
    EmptyPayload,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;
