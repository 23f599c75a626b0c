use crate::indexer::{ChainIndexerBackend, IndexerError};
use dos_interfaces::db::WriteBatch;
use dos_primitives::{SealedHeader, B256};
use dos_provider::ChainProvider;

/// Number of bits of a log bloom.
pub const BLOOM_BIT_LENGTH: usize = 2048;

const BLOOM_BYTE_LENGTH: usize = BLOOM_BIT_LENGTH / 8;

fn bloom_bits_key(bit: usize, section: u64, head: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(3 + 2 + 8 + 32);
    key.extend_from_slice(b"blt");
    key.extend_from_slice(&(bit as u16).to_be_bytes());
    key.extend_from_slice(&section.to_be_bytes());
    key.extend_from_slice(head.as_slice());
    key
}

/// A [`ChainIndexerBackend`] storing the log blooms of a section rotated by 90 degrees.
///
/// For every bloom bit, one bit vector with one bit per block of the section is written. The
/// first block of a section is the most significant bit of the first byte. Vectors are keyed
/// by the hash of the last header of the section, so data of sections that were reorged out
/// is never read.
#[derive(Debug)]
pub struct BloomIndexer {
    provider: ChainProvider,
    section_size: u64,
    section: u64,
    head: B256,
    bits: Vec<Vec<u8>>,
}

impl BloomIndexer {
    /// Creates the backend. The section size must be a non-zero multiple of 8.
    pub fn new(provider: ChainProvider, section_size: u64) -> Result<Self, IndexerError> {
        if section_size == 0 || section_size % 8 != 0 {
            return Err(IndexerError::InvalidSectionSize(section_size))
        }
        Ok(Self { provider, section_size, section: 0, head: B256::ZERO, bits: Vec::new() })
    }

    /// A reader for the bit vectors this backend writes.
    pub fn reader(&self) -> BloomBitsReader {
        BloomBitsReader::new(self.provider.clone(), self.section_size)
    }
}

impl ChainIndexerBackend for BloomIndexer {
    fn reset(&mut self, section: u64, _prev_head: B256) -> Result<(), IndexerError> {
        self.section = section;
        self.head = B256::ZERO;
        self.bits = vec![vec![0; (self.section_size / 8) as usize]; BLOOM_BIT_LENGTH];
        Ok(())
    }

    fn process(&mut self, header: &SealedHeader) -> Result<(), IndexerError> {
        let index = (header.number - self.section * self.section_size) as usize;
        let (byte, mask) = (index / 8, 1u8 << (7 - index % 8));
        let bloom = header.logs_bloom.as_slice();
        for (bit, vector) in self.bits.iter_mut().enumerate() {
            if bloom[BLOOM_BYTE_LENGTH - 1 - bit / 8] & (1 << (bit % 8)) != 0 {
                vector[byte] |= mask;
            }
        }
        self.head = header.hash();
        Ok(())
    }

    fn commit(&mut self) -> Result<(), IndexerError> {
        let mut batch = WriteBatch::default();
        for (bit, vector) in self.bits.iter().enumerate() {
            batch.put(bloom_bits_key(bit, self.section, self.head), vector.clone());
        }
        self.provider.db().write_batch(batch)?;
        Ok(())
    }
}

/// Reads the bit vectors written by a [`BloomIndexer`] for the canonical chain.
#[derive(Debug, Clone)]
pub struct BloomBitsReader {
    provider: ChainProvider,
    section_size: u64,
}

impl BloomBitsReader {
    /// Creates a reader for sections of the given size.
    pub fn new(provider: ChainProvider, section_size: u64) -> Self {
        Self { provider, section_size }
    }

    /// The bit vector of a bloom bit over a canonical section.
    ///
    /// Returns `None` if the section has not been indexed.
    pub fn bloom_bits(&self, bit: usize, section: u64) -> Result<Option<Vec<u8>>, IndexerError> {
        if bit >= BLOOM_BIT_LENGTH {
            return Ok(None)
        }
        let last = (section + 1) * self.section_size - 1;
        let Some(head) = self.provider.canonical_hash(last)? else { return Ok(None) };
        Ok(self.provider.db().get(&bloom_bits_key(bit, section, head))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChainIndexer;
    use assert_matches::assert_matches;
    use dos_interfaces::{db::MemoryDatabase, test_utils::TestChain};
    use dos_primitives::Bloom;
    use std::sync::Arc;

    fn provider(chain: &TestChain) -> ChainProvider {
        let provider = ChainProvider::new(Arc::new(MemoryDatabase::new()));
        provider.init_genesis(chain.genesis()).unwrap();
        let headers: Vec<SealedHeader> =
            chain.blocks()[1..].iter().map(|block| block.header.clone()).collect();
        provider.insert_headers(&headers).unwrap();
        provider
    }

    fn bit_set(bloom: &Bloom, bit: usize) -> bool {
        bloom.as_slice()[BLOOM_BYTE_LENGTH - 1 - bit / 8] & (1 << (bit % 8)) != 0
    }

    #[test]
    fn section_size_must_be_byte_aligned() {
        let provider = ChainProvider::new(Arc::new(MemoryDatabase::new()));
        assert_matches!(
            BloomIndexer::new(provider.clone(), 12),
            Err(IndexerError::InvalidSectionSize(12))
        );
        assert_matches!(BloomIndexer::new(provider, 0), Err(IndexerError::InvalidSectionSize(0)));
    }

    #[test]
    fn bits_are_rotated_per_section() {
        let chain = TestChain::new(40);
        let provider = provider(&chain);
        let backend = BloomIndexer::new(provider.clone(), 16).unwrap();
        let reader = backend.reader();
        let indexer =
            ChainIndexer::new(provider, Box::new(backend), "bloombits", 16, 4, dos_metrics::noop())
                .unwrap();

        indexer.new_head(chain.head_number(), false).unwrap();
        while indexer.process_next().unwrap() {}
        assert_eq!(indexer.sections().unwrap().count, 2);

        for section in 0..2u64 {
            for bit in 0..BLOOM_BIT_LENGTH {
                let vector = reader.bloom_bits(bit, section).unwrap().unwrap();
                assert_eq!(vector.len(), 2);
                for index in 0..16u64 {
                    let header = chain.header(section * 16 + index).unwrap();
                    let expected = bit_set(&header.logs_bloom, bit);
                    let stored = vector[(index / 8) as usize] & (1 << (7 - index % 8)) != 0;
                    assert_eq!(stored, expected, "bit {bit} of block {}", header.number);
                }
            }
        }
        // blocks with transactions carry logs
        let header = chain.header(1).unwrap();
        let bit = (0..BLOOM_BIT_LENGTH).find(|bit| bit_set(&header.logs_bloom, *bit)).unwrap();
        assert_ne!(reader.bloom_bits(bit, 0).unwrap().unwrap()[0] & 0b0100_0000, 0);
    }

    #[test]
    fn unfinished_section_is_not_readable() {
        let chain = TestChain::new(40);
        let provider = provider(&chain);
        let backend = BloomIndexer::new(provider.clone(), 16).unwrap();
        let reader = backend.reader();
        let indexer =
            ChainIndexer::new(provider, Box::new(backend), "bloombits", 16, 4, dos_metrics::noop())
                .unwrap();

        indexer.new_head(35, false).unwrap();
        while indexer.process_next().unwrap() {}
        assert_eq!(indexer.sections().unwrap().count, 1);
        assert!(reader.bloom_bits(0, 0).unwrap().is_some());
        assert_eq!(reader.bloom_bits(0, 1).unwrap(), None);
        assert_eq!(reader.bloom_bits(BLOOM_BIT_LENGTH, 0).unwrap(), None);
    }

    #[test]
    fn reorged_section_is_not_readable() {
        let chain = TestChain::new(40);
        let provider = provider(&chain);
        let backend = BloomIndexer::new(provider.clone(), 16).unwrap();
        let reader = backend.reader();
        let indexer = ChainIndexer::new(
            provider.clone(),
            Box::new(backend),
            "bloombits",
            16,
            4,
            dos_metrics::noop(),
        )
        .unwrap();
        indexer.new_head(chain.head_number(), false).unwrap();
        while indexer.process_next().unwrap() {}

        let fork = chain.fork(20, 30, 1);
        let headers: Vec<SealedHeader> =
            fork.blocks()[21..].iter().map(|block| block.header.clone()).collect();
        provider.insert_headers(&headers).unwrap();
        assert!(reader.bloom_bits(0, 0).unwrap().is_some());
        assert_eq!(reader.bloom_bits(0, 1).unwrap(), None);
    }
}
