use crate::PING_MAGIC;
use crate::crypto::{PrivateKey, PublicKey, Signature};
use crate::error::{LedgerError, Result};
use crate::types::{Block, Transaction};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ===== Rendezvous replies =====
pub const ACCEPTED: &[u8] = b"Accepted";
pub const REJECTED: &[u8] = b"Rejected";
pub const UNKNOWN: &[u8] = b"Unknown";
pub const PERMISSION_DENIED: &[u8] = b"Permission Denied";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    ChainRequest = 1,
    ChainResponse = 2,
    NewBlock = 3,
    NewTransaction = 4,
}

impl MessageType {
    pub fn tag(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for MessageType {
    type Error = LedgerError;
    fn try_from(tag: u32) -> Result<Self> {
        match tag {
            1 => Ok(MessageType::ChainRequest),
            2 => Ok(MessageType::ChainResponse),
            3 => Ok(MessageType::NewBlock),
            4 => Ok(MessageType::NewTransaction),
            other => Err(LedgerError::UnknownMessageType(other)),
        }
    }
}

/// Application payloads: a little-endian u32 tag followed by the body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    ChainRequest,
    /// Concatenated block records, oldest first.
    ChainResponse(Vec<u8>),
    NewBlock(Block),
    NewTransaction(Transaction),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::ChainRequest => MessageType::ChainRequest,
            Message::ChainResponse(_) => MessageType::ChainResponse,
            Message::NewBlock(_) => MessageType::NewBlock,
            Message::NewTransaction(_) => MessageType::NewTransaction,
        }
    }
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut payload = self.message_type().tag().to_le_bytes().to_vec();
        match self {
            Message::ChainRequest => {}
            Message::ChainResponse(blocks) => payload.extend_from_slice(blocks),
            Message::NewBlock(block) => block.encode_into(&mut payload)?,
            Message::NewTransaction(transaction) => {
                payload.extend_from_slice(&transaction.encode()?)
            }
        }
        Ok(payload)
    }
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (message_type, body) = split_payload(payload)?;
        Ok(match message_type {
            MessageType::ChainRequest => Message::ChainRequest,
            MessageType::ChainResponse => Message::ChainResponse(body.to_vec()),
            MessageType::NewBlock => Message::NewBlock(Block::decode(body)?),
            MessageType::NewTransaction => Message::NewTransaction(Transaction::decode(body)?),
        })
    }
}

/// Splits an application payload into its tag and body.
pub fn split_payload(payload: &[u8]) -> Result<(MessageType, &[u8])> {
    if payload.len() < 4 {
        return Err(LedgerError::MalformedMessage("payload shorter than its tag"));
    }
    let (tag, body) = payload.split_at(4);
    let tag = u32::from_le_bytes([tag[0], tag[1], tag[2], tag[3]]);
    Ok((MessageType::try_from(tag)?, body))
}

/// `[len(data): u16][len(sig): u16][data][sig]`, all lengths little-endian.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub signature: Signature,
}

/// What arrives on an inbound connection.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Ping,
    Signed(Frame),
}

impl Frame {
    pub fn sign(data: Vec<u8>, private_key: &PrivateKey) -> Result<Self> {
        if data.is_empty() {
            return Err(LedgerError::EmptyPayload);
        }
        if data.len() > u16::MAX as usize {
            return Err(LedgerError::FrameTooLarge(data.len()));
        }
        let signature = Signature::sign(&data, private_key)?;
        if signature.as_bytes().len() > u16::MAX as usize {
            return Err(LedgerError::FrameTooLarge(signature.as_bytes().len()));
        }
        Ok(Frame { data, signature })
    }
    pub fn verify(&self, public_key: &PublicKey) -> bool {
        self.signature.verify(&self.data, public_key)
    }
    pub fn encode(&self) -> Vec<u8> {
        let signature = self.signature.as_bytes();
        let mut out = Vec::with_capacity(4 + self.data.len() + signature.len());
        out.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        out.extend_from_slice(&(signature.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.data);
        out.extend_from_slice(signature);
        out
    }
    pub async fn send_async<W: AsyncWrite + Unpin>(&self, stream: &mut W) -> Result<()> {
        stream.write_all(&self.encode()).await?;
        stream.flush().await?;
        Ok(())
    }
    pub async fn receive_async<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Inbound> {
        let data_len = stream.read_u16_le().await? as usize;
        let sig_len = stream.read_u16_le().await? as usize;
        if data_len == 0 {
            return Ok(Inbound::Ping);
        }
        let mut data = vec![0u8; data_len];
        stream.read_exact(&mut data).await?;
        let mut signature = vec![0u8; sig_len];
        stream.read_exact(&mut signature).await?;
        Ok(Inbound::Signed(Frame {
            data,
            signature: Signature::from_bytes(signature),
        }))
    }
}

/// Liveness probe: a frame with both lengths zero.
pub async fn send_ping<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<bool> {
    stream.write_all(&[0u8; 4]).await?;
    stream.flush().await?;
    Ok(stream.read_u32_le().await? == PING_MAGIC)
}

pub async fn send_pong<W: AsyncWrite + Unpin>(stream: &mut W) -> Result<()> {
    stream.write_u32_le(PING_MAGIC).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sha256::Hash;
    use crate::types::{BlockHeader, ClosedBet, BetId};

    #[test]
    fn tags_are_little_endian_prefixes() {
        let payload = Message::ChainRequest.encode().unwrap();
        assert_eq!(payload, vec![1, 0, 0, 0]);

        let block = Block::new(BlockHeader::new(Hash::genesis(), 3, 4), vec![]);
        let payload = Message::NewBlock(block.clone()).encode().unwrap();
        assert_eq!(&payload[..4], &[3, 0, 0, 0]);
        assert_eq!(Message::decode(&payload).unwrap(), Message::NewBlock(block));

        let close = Transaction::Closed(ClosedBet::new(BetId::new(), "B").unwrap());
        let payload = Message::NewTransaction(close.clone()).encode().unwrap();
        assert_eq!(payload.len(), 4 + crate::TRANSACTION_RECORD_SIZE);
        let (message_type, body) = split_payload(&payload).unwrap();
        assert_eq!(message_type, MessageType::NewTransaction);
        assert_eq!(Transaction::decode(body).unwrap(), close);
    }

    #[test]
    fn unknown_tags_are_refused() {
        assert!(matches!(
            split_payload(&[9, 0, 0, 0]),
            Err(LedgerError::UnknownMessageType(9))
        ));
        assert!(split_payload(&[1, 0]).is_err());
    }

    #[test]
    fn frames_refuse_empty_and_oversized_payloads() {
        let key = PrivateKey::generate(1024).unwrap();
        assert!(matches!(
            Frame::sign(vec![], &key),
            Err(LedgerError::EmptyPayload)
        ));
        assert!(matches!(
            Frame::sign(vec![0; u16::MAX as usize + 1], &key),
            Err(LedgerError::FrameTooLarge(_))
        ));
    }
}
