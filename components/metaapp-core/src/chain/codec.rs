use bitcoin::consensus::deserialize;
use bitcoin::{Block, Transaction};

use super::txid::{compact_txid, COMPACT_HASH_MIN_VERSION};
use super::ChainKind;

/// The capability set a chain variant has to provide. The two variants only
/// diverge in `txid`; consumers downstream of the decode edge never branch
/// on the chain again.
pub trait ChainCodec {
    fn parse_tx(&self, raw: &[u8]) -> Result<Transaction, String>;
    fn parse_block(&self, raw: &[u8]) -> Result<Block, String>;
    fn txid(&self, tx: &Transaction) -> String;
}

pub struct BtcCodec;

impl ChainCodec for BtcCodec {
    fn parse_tx(&self, raw: &[u8]) -> Result<Transaction, String> {
        deserialize::<Transaction>(raw)
            .map_err(|e| format!("unable to deserialize btc transaction: {}", e))
    }

    fn parse_block(&self, raw: &[u8]) -> Result<Block, String> {
        deserialize::<Block>(raw).map_err(|e| format!("unable to deserialize btc block: {}", e))
    }

    fn txid(&self, tx: &Transaction) -> String {
        tx.txid().to_string()
    }
}

pub struct MvcCodec;

impl ChainCodec for MvcCodec {
    fn parse_tx(&self, raw: &[u8]) -> Result<Transaction, String> {
        deserialize::<Transaction>(raw)
            .map_err(|e| format!("unable to deserialize mvc transaction: {}", e))
    }

    fn parse_block(&self, raw: &[u8]) -> Result<Block, String> {
        deserialize::<Block>(raw).map_err(|e| format!("unable to deserialize mvc block: {}", e))
    }

    fn txid(&self, tx: &Transaction) -> String {
        if tx.version.0 >= COMPACT_HASH_MIN_VERSION {
            compact_txid(tx)
        } else {
            tx.txid().to_string()
        }
    }
}

pub fn codec_for(chain: ChainKind) -> Box<dyn ChainCodec + Send + Sync> {
    match chain {
        ChainKind::Btc => Box::new(BtcCodec),
        ChainKind::Mvc => Box::new(MvcCodec),
    }
}

#[cfg(test)]
mod test {
    use bitcoin::consensus::serialize;

    use super::super::txid::test::sample_transaction;
    use super::{BtcCodec, ChainCodec, MvcCodec};

    #[test]
    fn wire_format_is_shared_across_variants() {
        let tx = sample_transaction(10);
        let raw = serialize(&tx);
        let via_btc = BtcCodec.parse_tx(&raw).unwrap();
        let via_mvc = MvcCodec.parse_tx(&raw).unwrap();
        assert_eq!(via_btc, via_mvc);
    }

    #[test]
    fn legacy_version_hashes_like_btc() {
        let tx = sample_transaction(2);
        assert_eq!(MvcCodec.txid(&tx), BtcCodec.txid(&tx));
    }

    #[test]
    fn version_ten_switches_to_compact_hash() {
        let tx = sample_transaction(10);
        assert_ne!(MvcCodec.txid(&tx), BtcCodec.txid(&tx));
    }

    #[test]
    fn garbage_bytes_are_refused() {
        assert!(BtcCodec.parse_tx(&[0xde, 0xad]).is_err());
        assert!(MvcCodec.parse_block(&[0xbe, 0xef]).is_err());
    }

    #[test]
    fn blocks_round_trip_through_the_codec() {
        use bitcoin::block::{Header, Version};
        use bitcoin::hashes::Hash;
        use bitcoin::{Block, BlockHash, CompactTarget, TxMerkleNode};

        let block = Block {
            header: Header {
                version: Version::from_consensus(2),
                prev_blockhash: BlockHash::all_zeros(),
                merkle_root: TxMerkleNode::all_zeros(),
                time: 1_700_000_000,
                bits: CompactTarget::from_consensus(0x1d00ffff),
                nonce: 7,
            },
            txdata: vec![sample_transaction(10)],
        };
        let raw = serialize(&block);
        let parsed = MvcCodec.parse_block(&raw).unwrap();
        assert_eq!(parsed.header.time, 1_700_000_000);
        assert_eq!(parsed.txdata.len(), 1);
        assert_eq!(
            MvcCodec.txid(&parsed.txdata[0]),
            MvcCodec.txid(&block.txdata[0])
        );
    }
}
