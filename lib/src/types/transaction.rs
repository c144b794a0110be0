use crate::TRANSACTION_RECORD_SIZE;
use crate::error::{LedgerError, Result};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 128-bit random bet identifier, rendered as 22 characters of unpadded
/// URL-safe base64 to leave room in the 64-byte record.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BetId(Uuid);

impl BetId {
    pub fn new() -> Self {
        BetId(Uuid::new_v4())
    }
}

impl Default for BetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BetId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(self.0.as_bytes()))
    }
}

impl FromStr for BetId {
    type Err = LedgerError;
    fn from_str(s: &str) -> Result<Self> {
        URL_SAFE_NO_PAD
            .decode(s)
            .ok()
            .and_then(|bytes| Uuid::from_slice(&bytes).ok())
            .map(BetId)
            .ok_or_else(|| LedgerError::MalformedRecord(format!("bad bet id {s:?}")))
    }
}

/// A wager amount kept in its textual form so it serializes byte for byte.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Amount(String);

impl Amount {
    pub fn parse(text: &str) -> Result<Self> {
        let value = BigDecimal::from_str(text)
            .map_err(|_| LedgerError::InvalidAmount(text.to_string()))?;
        if value < BigDecimal::from(0) {
            return Err(LedgerError::InvalidAmount(text.to_string()));
        }
        Ok(Amount(text.to_string()))
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct OpenBet {
    pub id: BetId,
    pub originator: String,
    pub event: String,
    pub win_condition: String,
    pub amount: Amount,
    /// Absolute unix timestamp (seconds).
    pub expiration: u64,
}

impl OpenBet {
    pub fn new(
        originator: &str,
        event: &str,
        win_condition: &str,
        amount: &str,
        expiration_minutes: u64,
        now: u64,
    ) -> Result<Self> {
        let expiration = now.saturating_add(expiration_minutes.saturating_mul(60));
        if expiration <= now {
            return Err(LedgerError::InvalidExpiration);
        }
        let bet = OpenBet {
            id: BetId::new(),
            originator: check_field("originator", originator)?,
            event: check_field("event", event)?,
            win_condition: check_field("win_condition", win_condition)?,
            amount: Amount::parse(amount)?,
            expiration,
        };
        Ok(bet)
    }
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expiration
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClosedBet {
    pub bet_id: BetId,
    pub caller: String,
}

impl ClosedBet {
    pub fn new(bet_id: BetId, caller: &str) -> Result<Self> {
        Ok(ClosedBet {
            bet_id,
            caller: check_field("caller", caller)?,
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Transaction {
    Open(OpenBet),
    Closed(ClosedBet),
}

impl Transaction {
    pub fn bet_id(&self) -> BetId {
        match self {
            Transaction::Open(bet) => bet.id,
            Transaction::Closed(bet) => bet.bet_id,
        }
    }
    /// Fixed-size wire record, NUL padded.
    pub fn encode(&self) -> Result<[u8; TRANSACTION_RECORD_SIZE]> {
        let text = self.to_string();
        if text.len() > TRANSACTION_RECORD_SIZE {
            return Err(LedgerError::RecordTooLong(text.len()));
        }
        let mut record = [0u8; TRANSACTION_RECORD_SIZE];
        record[..text.len()].copy_from_slice(text.as_bytes());
        Ok(record)
    }
    pub fn decode(record: &[u8]) -> Result<Self> {
        if record.len() != TRANSACTION_RECORD_SIZE {
            return Err(LedgerError::MalformedRecord(format!(
                "record is {} bytes",
                record.len()
            )));
        }
        let end = record
            .iter()
            .rposition(|byte| *byte != 0)
            .map(|idx| idx + 1)
            .unwrap_or(0);
        let text = std::str::from_utf8(&record[..end])
            .map_err(|_| LedgerError::MalformedRecord("record is not UTF-8".into()))?;
        text.parse()
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Transaction::Open(bet) => write!(
                f,
                "open|{}|{}|{}|{}|{}|{}|",
                bet.id, bet.originator, bet.event, bet.win_condition, bet.amount, bet.expiration
            ),
            Transaction::Closed(bet) => write!(f, "closed|{}|{}", bet.bet_id, bet.caller),
        }
    }
}

impl FromStr for Transaction {
    type Err = LedgerError;
    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split('|').collect();
        match fields.as_slice() {
            ["open", id, originator, event, win_condition, amount, expiration, ""] => {
                let expiration = expiration.parse::<u64>().map_err(|_| {
                    LedgerError::MalformedRecord(format!("bad expiration {expiration:?}"))
                })?;
                Ok(Transaction::Open(OpenBet {
                    id: id.parse()?,
                    originator: check_field("originator", originator)?,
                    event: check_field("event", event)?,
                    win_condition: check_field("win_condition", win_condition)?,
                    amount: Amount::parse(amount)?,
                    expiration,
                }))
            }
            ["closed", id, caller] => Ok(Transaction::Closed(ClosedBet::new(id.parse()?, caller)?)),
            _ => Err(LedgerError::MalformedRecord(s.to_string())),
        }
    }
}

fn check_field(field: &'static str, value: &str) -> Result<String> {
    if value.is_empty() {
        return Err(LedgerError::InvalidField {
            field,
            reason: "must not be empty".into(),
        });
    }
    if value.contains(['|', '\0']) {
        return Err(LedgerError::InvalidField {
            field,
            reason: "must not contain '|' or NUL".into(),
        });
    }
    Ok(value.to_string())
}
