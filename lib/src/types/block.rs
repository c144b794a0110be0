use super::Transaction;
use crate::error::{LedgerError, Result};
use crate::sha256::Hash;
use crate::{BLOCK_HEADER_SIZE, HASHED_HEADER_SIZE, TRANSACTION_RECORD_SIZE};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Block {
            header,
            transactions,
        }
    }
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }
    pub fn tx_count(&self) -> u32 {
        self.transactions.len() as u32
    }
    /// Checks that this block may follow `prev_hash` under `difficulty` bits.
    pub fn verify(&self, prev_hash: &Hash, difficulty: u32) -> Result<()> {
        self.header.verify(prev_hash, difficulty)
    }
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out =
            Vec::with_capacity(BLOCK_HEADER_SIZE + self.transactions.len() * TRANSACTION_RECORD_SIZE);
        self.encode_into(&mut out)?;
        Ok(out)
    }
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.header.hashed_bytes());
        out.extend_from_slice(&self.tx_count().to_le_bytes());
        for transaction in &self.transactions {
            out.extend_from_slice(&transaction.encode()?);
        }
        Ok(())
    }
    /// Decodes one block record at the front of `data`, returning it with the
    /// number of bytes it occupied.
    pub fn decode_prefix(data: &[u8]) -> Result<(Block, usize)> {
        let header = BlockHeader::decode(data)?;
        let tx_count = read_u32(data, 40)? as usize;
        let body_len = tx_count
            .checked_mul(TRANSACTION_RECORD_SIZE)
            .ok_or(LedgerError::MalformedBlock("transaction count overflows"))?;
        let total = BLOCK_HEADER_SIZE + body_len;
        if data.len() < total {
            return Err(LedgerError::MalformedBlock(
                "declared transaction count exceeds the record",
            ));
        }
        let transactions = data[BLOCK_HEADER_SIZE..total]
            .chunks_exact(TRANSACTION_RECORD_SIZE)
            .map(Transaction::decode)
            .collect::<Result<Vec<_>>>()?;
        Ok((Block::new(header, transactions), total))
    }
    pub fn decode(data: &[u8]) -> Result<Block> {
        let (block, used) = Self::decode_prefix(data)?;
        if used != data.len() {
            return Err(LedgerError::MalformedBlock("trailing bytes after block"));
        }
        Ok(block)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub prev_block_hash: Hash,
    pub timestamp: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn new(prev_block_hash: Hash, timestamp: u32, nonce: u32) -> Self {
        BlockHeader {
            prev_block_hash,
            timestamp,
            nonce,
        }
    }
    /// The bytes covered by proof of work.
    pub fn hashed_bytes(&self) -> [u8; HASHED_HEADER_SIZE] {
        let mut bytes = [0u8; HASHED_HEADER_SIZE];
        bytes[..32].copy_from_slice(self.prev_block_hash.as_bytes());
        bytes[32..36].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[36..40].copy_from_slice(&self.nonce.to_le_bytes());
        bytes
    }
    pub fn hash(&self) -> Hash {
        Hash::digest(&self.hashed_bytes())
    }
    pub fn meets_difficulty(&self, difficulty: u32) -> bool {
        self.hash().meets_difficulty(difficulty)
    }
    pub fn verify(&self, prev_hash: &Hash, difficulty: u32) -> Result<()> {
        if self.prev_block_hash != *prev_hash {
            return Err(LedgerError::PrevHashMismatch);
        }
        if !self.meets_difficulty(difficulty) {
            return Err(LedgerError::InsufficientWork);
        }
        Ok(())
    }
    // reads the hashed part of a block record
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < BLOCK_HEADER_SIZE {
            return Err(LedgerError::MalformedBlock("record shorter than a header"));
        }
        let mut prev = [0u8; 32];
        prev.copy_from_slice(&data[..32]);
        Ok(BlockHeader::new(
            Hash::from_bytes(prev),
            read_u32(data, 32)?,
            read_u32(data, 36)?,
        ))
    }
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(LedgerError::MalformedBlock("truncated integer"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClosedBet, OpenBet};

    fn mine(prev: Hash, difficulty: u32) -> BlockHeader {
        (1..)
            .map(|nonce| BlockHeader::new(prev, 1_700_000_000, nonce))
            .find(|header| header.meets_difficulty(difficulty))
            .unwrap()
    }

    #[test]
    fn record_layout_is_header_then_fixed_records() {
        let open = OpenBet::new("a", "rain", "yes", "50", 1, 1_700_000_000).unwrap();
        let close = ClosedBet::new(open.id, "b").unwrap();
        let block = Block::new(
            BlockHeader::new(Hash::genesis(), 7, 9),
            vec![Transaction::Open(open), Transaction::Closed(close)],
        );
        let bytes = block.encode().unwrap();
        assert_eq!(bytes.len(), BLOCK_HEADER_SIZE + 2 * TRANSACTION_RECORD_SIZE);
        assert_eq!(&bytes[..32], Hash::genesis().as_bytes());
        assert_eq!(&bytes[32..36], &7u32.to_le_bytes());
        assert_eq!(&bytes[36..40], &9u32.to_le_bytes());
        assert_eq!(&bytes[40..44], &2u32.to_le_bytes());
        let decoded = Block::decode(&bytes).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn declared_count_must_match_body() {
        let block = Block::new(BlockHeader::new(Hash::genesis(), 1, 1), vec![]);
        let mut bytes = block.encode().unwrap();
        bytes[40] = 3;
        assert!(Block::decode(&bytes).is_err());
        assert!(Block::decode(&bytes[..20]).is_err());
    }

    #[test]
    fn verification_checks_link_and_work() {
        let header = mine(Hash::genesis(), 8);
        assert!(header.hash().leading_zero_bits() >= 8);
        assert!(header.verify(&Hash::genesis(), 8).is_ok());
        assert!(matches!(
            header.verify(&Hash::digest(b"elsewhere"), 8),
            Err(LedgerError::PrevHashMismatch)
        ));
        // 64 zero bits will not appear by accident
        assert!(matches!(
            header.verify(&Hash::genesis(), 64),
            Err(LedgerError::InsufficientWork)
        ));
    }
}
