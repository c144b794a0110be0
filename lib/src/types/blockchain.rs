use super::{Block, Transaction};
use crate::error::Result;
use crate::sha256::Hash;
use crate::util::Saveable;
use serde::{Deserialize, Serialize};
use std::io::{Error as IoError, ErrorKind as IoErrorKind, Read, Result as IoResult, Write};

impl Saveable for Blockchain {
    fn load<I: Read>(reader: I) -> IoResult<Self> {
        ciborium::de::from_reader(reader)
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "Failed to deserialize Blockchain"))
    }
    fn save<O: Write>(&self, writer: O) -> IoResult<()> {
        ciborium::ser::into_writer(self, writer)
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "Failed to serialize Blockchain"))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Blockchain {
    blocks: Vec<Block>,
    difficulty: u32,
}

impl Blockchain {
    pub fn new(difficulty: u32) -> Self {
        Blockchain {
            blocks: vec![],
            difficulty,
        }
    }
    /// Builds a chain from untrusted blocks, keeping the longest valid prefix.
    pub fn from_blocks<I: IntoIterator<Item = Block>>(difficulty: u32, blocks: I) -> Self {
        let mut chain = Blockchain::new(difficulty);
        for block in blocks {
            if chain.append(block).is_err() {
                break;
            }
        }
        chain
    }
    /// Parses a download response body (concatenated block records). Each
    /// block must extend the one before it in the same stream, starting from
    /// genesis; the first record that fails to decode or to link ends the
    /// accepted prefix.
    pub fn from_download(difficulty: u32, mut data: &[u8]) -> Self {
        let mut chain = Blockchain::new(difficulty);
        while !data.is_empty() {
            let Ok((block, used)) = Block::decode_prefix(data) else {
                break;
            };
            if chain.append(block).is_err() {
                break;
            }
            data = &data[used..];
        }
        chain
    }
    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }
    pub fn block_height(&self) -> u64 {
        self.blocks.len() as u64
    }
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
    /// Hash the next block must reference.
    pub fn tip_hash(&self) -> Hash {
        self.blocks
            .last()
            .map(|block| block.hash())
            .unwrap_or_else(Hash::genesis)
    }
    pub fn append(&mut self, block: Block) -> Result<()> {
        block.verify(&self.tip_hash(), self.difficulty)?;
        self.blocks.push(block);
        Ok(())
    }
    /// Longest-chain rule: `candidate` wins when we have nothing yet or it is
    /// strictly longer. Returns whether the chain was replaced.
    pub fn adopt(&mut self, candidate: Blockchain) -> bool {
        if self.blocks.is_empty() || candidate.blocks.len() > self.blocks.len() {
            self.blocks = candidate.blocks;
            return true;
        }
        false
    }
    /// Concatenated block records, oldest first.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = vec![];
        for block in &self.blocks {
            block.encode_into(&mut out)?;
        }
        Ok(out)
    }
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }
    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.blocks.iter().flat_map(|block| block.transactions.iter())
    }
    pub fn into_blocks(self) -> Vec<Block> {
        self.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::types::{BlockHeader, OpenBet};

    const DIFFICULTY: u32 = 6;

    fn next_block(chain: &Blockchain, salt: u32, transactions: Vec<Transaction>) -> Block {
        let prev = chain.tip_hash();
        let header = (1..)
            .map(|nonce| BlockHeader::new(prev, 1_700_000_000 + salt, nonce))
            .find(|header| header.meets_difficulty(chain.difficulty()))
            .unwrap();
        Block::new(header, transactions)
    }

    fn grow(chain: &mut Blockchain, count: usize, salt: u32) {
        for _ in 0..count {
            let block = next_block(chain, salt, vec![]);
            chain.append(block).unwrap();
        }
    }

    #[test]
    fn empty_chain_builds_on_genesis() {
        let mut chain = Blockchain::new(DIFFICULTY);
        assert_eq!(chain.tip_hash(), Hash::genesis());
        grow(&mut chain, 2, 0);
        assert_eq!(chain.block_height(), 2);
        assert!(chain.blocks().all(|b| b.hash().leading_zero_bits() >= DIFFICULTY));
    }

    #[test]
    fn append_rejects_blocks_off_the_tip() {
        let mut chain = Blockchain::new(DIFFICULTY);
        grow(&mut chain, 1, 0);
        let mut stale = Blockchain::new(DIFFICULTY);
        let orphan = next_block(&stale, 99, vec![]);
        stale.append(orphan.clone()).unwrap();
        assert!(matches!(chain.append(orphan), Err(LedgerError::PrevHashMismatch)));
        assert_eq!(chain.block_height(), 1);
    }

    #[test]
    fn download_keeps_the_valid_prefix() {
        let mut source = Blockchain::new(DIFFICULTY);
        let bet = OpenBet::new("a", "rain", "yes", "5", 1, 1_700_000_000).unwrap();
        let first = next_block(&source, 0, vec![Transaction::Open(bet)]);
        source.append(first).unwrap();
        grow(&mut source, 2, 0);
        let mut bytes = source.encode().unwrap();

        let full = Blockchain::from_download(DIFFICULTY, &bytes);
        assert_eq!(full.block_height(), 3);
        assert_eq!(full.encode().unwrap(), bytes);
        assert_eq!(full.transactions().count(), 1);

        // corrupt the prev hash of the third block
        let third = bytes.len() - crate::BLOCK_HEADER_SIZE;
        bytes[third] ^= 0xff;
        let truncated = Blockchain::from_download(DIFFICULTY, &bytes);
        assert_eq!(truncated.block_height(), 2);

        let cut = Blockchain::from_download(DIFFICULTY, &bytes[..bytes.len() - 3]);
        assert_eq!(cut.block_height(), 2);
    }

    #[test]
    fn longest_chain_wins_and_ties_keep_ours() {
        let mut ours = Blockchain::new(DIFFICULTY);
        grow(&mut ours, 2, 1);
        let tip = ours.tip_hash();

        let mut same_length = Blockchain::new(DIFFICULTY);
        grow(&mut same_length, 2, 2);
        assert!(!ours.adopt(same_length));
        assert_eq!(ours.tip_hash(), tip);

        let mut longer = Blockchain::new(DIFFICULTY);
        grow(&mut longer, 3, 3);
        let longer_tip = longer.tip_hash();
        assert!(ours.adopt(longer));
        assert_eq!(ours.tip_hash(), longer_tip);
        assert_eq!(ours.block_height(), 3);

        let mut empty = Blockchain::new(DIFFICULTY);
        assert!(empty.adopt(Blockchain::new(DIFFICULTY)));
    }

    #[test]
    fn saved_chains_reload() {
        let mut chain = Blockchain::new(DIFFICULTY);
        grow(&mut chain, 2, 4);
        let mut bytes = vec![];
        chain.save(&mut bytes).unwrap();
        let loaded = Blockchain::load(bytes.as_slice()).unwrap();
        let verified = Blockchain::from_blocks(DIFFICULTY, loaded.into_blocks());
        assert_eq!(verified.tip_hash(), chain.tip_hash());
    }
}
