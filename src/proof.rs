//! Receipt inclusion proofs
//!
//! Builds the Merkle-Patricia trie a block commits to in its receipts root
//! and extracts the root-to-leaf path for one transaction index.
//!
//! The algorithm matches the execution clients' `DeriveSha`:
//! 1. For each receipt at index i, the key is RLP(i)
//! 2. The value is the EIP-2718 encoding of the receipt (type byte followed by
//!    the RLP body for typed receipts, bare RLP for legacy ones)
//! 3. Leaves are inserted in key order and hashed bottom-up
//!
//! The trie is ephemeral: it is built per block and never persisted. A proof
//! is only meaningful against a root the destination already trusts.

use alloy::consensus::{Receipt as ConsensusReceipt, ReceiptWithBloom};
use alloy::primitives::{Address, Bloom, Bytes, Log, B256};
use alloy_rlp::Encodable;
use alloy_trie::proof::{verify_proof, ProofRetainer};
use alloy_trie::{HashBuilder, Nibbles, EMPTY_ROOT_HASH};

/// Highest type byte allowed by EIP-2718
const MAX_TX_TYPE: u8 = 0x7f;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProofError {
    #[error("receipt index {index} out of range for block with {len} receipts")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("cannot build a receipt trie for a block without receipts")]
    EmptyReceipts,
    #[error("unsupported transaction type 0x{0:02x}")]
    UnsupportedTxType(u8),
    #[error("malformed proof: {0}")]
    Malformed(String),
}

/// A log as committed in a receipt
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReceiptLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/// One transaction receipt of a block
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Receipt {
    /// EIP-2718 type byte, 0 for legacy
    pub tx_type: u8,
    pub success: bool,
    pub cumulative_gas_used: u64,
    pub logs_bloom: Bloom,
    pub logs: Vec<ReceiptLog>,
}

impl Receipt {
    /// The receipt as alloy's consensus type
    pub fn to_consensus(&self) -> ReceiptWithBloom {
        let logs = self
            .logs
            .iter()
            .map(|log| Log::new_unchecked(log.address, log.topics.clone(), log.data.clone()))
            .collect();
        ReceiptWithBloom {
            receipt: ConsensusReceipt {
                status: self.success.into(),
                cumulative_gas_used: self.cumulative_gas_used.into(),
                logs,
            },
            logs_bloom: self.logs_bloom,
        }
    }

    /// Consensus encoding used as the trie value: the type byte for typed
    /// receipts, then the RLP of the receipt with its bloom
    pub fn encode_2718(&self) -> Result<Vec<u8>, ProofError> {
        if self.tx_type > MAX_TX_TYPE {
            return Err(ProofError::UnsupportedTxType(self.tx_type));
        }

        let consensus = self.to_consensus();
        let mut out = Vec::with_capacity(1 + consensus.length());
        if self.tx_type != 0 {
            out.push(self.tx_type);
        }
        consensus.encode(&mut out);
        Ok(out)
    }
}

/// Root-to-leaf path proving one receipt's membership
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InclusionProof {
    /// RLP encoding of the transaction index
    pub key: Bytes,
    /// Traversal key handed to the destination verifier, see [`key_path`]
    pub key_path: Bytes,
    /// Trie nodes ordered root first
    pub nodes: Vec<Bytes>,
    /// Root the proof was built against
    pub root: B256,
}

/// RLP-encodes an index for use as a trie key.
///
/// Index 0 becomes `[0x80]`, the encoding of the empty string.
pub fn encode_index(index: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    index.encode(&mut buf);
    buf
}

/// Key as the destination verifier walks it: one nibble per byte, unless the
/// whole trie is a single leaf, in which case the raw key.
pub fn key_path(key: &[u8], depth: usize) -> Vec<u8> {
    if depth == 1 {
        return key.to_vec();
    }
    key.iter().flat_map(|b| [b >> 4, b & 0x0f]).collect()
}

/// The receipts of one block, encoded and ready to prove
#[derive(Debug, Clone)]
pub struct ReceiptTrie {
    /// (rlp(index), encoded receipt) in index order
    leaves: Vec<(Vec<u8>, Vec<u8>)>,
    root: B256,
}

impl ReceiptTrie {
    pub fn new(receipts: &[Receipt]) -> Result<Self, ProofError> {
        let leaves = receipts
            .iter()
            .enumerate()
            .map(|(i, r)| Ok((encode_index(i), r.encode_2718()?)))
            .collect::<Result<Vec<_>, ProofError>>()?;

        let root = if leaves.is_empty() {
            EMPTY_ROOT_HASH
        } else {
            let mut builder = HashBuilder::default();
            for (key, value) in sorted(&leaves) {
                builder.add_leaf(Nibbles::unpack(key), value);
            }
            builder.root()
        };

        Ok(Self { leaves, root })
    }

    /// Receipts root committed to by the block header
    pub fn root(&self) -> B256 {
        self.root
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Encoded receipt stored at `index`
    pub fn leaf(&self, index: usize) -> Option<&[u8]> {
        self.leaves.get(index).map(|(_, v)| v.as_slice())
    }

    /// Proof for the receipt at transaction position `index`
    pub fn prove(&self, index: usize) -> Result<InclusionProof, ProofError> {
        if self.leaves.is_empty() {
            return Err(ProofError::EmptyReceipts);
        }
        let (key, _) = self.leaves.get(index).ok_or(ProofError::IndexOutOfRange {
            index,
            len: self.leaves.len(),
        })?;

        let target = Nibbles::unpack(key);
        let mut builder =
            HashBuilder::default().with_proof_retainer(ProofRetainer::new(vec![target]));
        for (k, v) in sorted(&self.leaves) {
            builder.add_leaf(Nibbles::unpack(k), v);
        }
        let root = builder.root();
        debug_assert_eq!(root, self.root);

        // Every retained path is a prefix of the target, so path order is
        // depth order.
        let nodes: Vec<Bytes> = builder
            .take_proof_nodes()
            .into_nodes_sorted()
            .into_iter()
            .map(|(_, node)| node)
            .collect();

        Ok(InclusionProof {
            key: Bytes::from(key.clone()),
            key_path: Bytes::from(key_path(key, nodes.len())),
            nodes,
            root,
        })
    }
}

fn sorted(leaves: &[(Vec<u8>, Vec<u8>)]) -> Vec<(&[u8], &[u8])> {
    let mut pairs: Vec<(&[u8], &[u8])> = leaves
        .iter()
        .map(|(k, v)| (k.as_slice(), v.as_slice()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    pairs
}

/// Build the inclusion proof for `receipts[index]`
pub fn build_proof(receipts: &[Receipt], index: usize) -> Result<InclusionProof, ProofError> {
    if receipts.is_empty() {
        return Err(ProofError::EmptyReceipts);
    }
    if index >= receipts.len() {
        return Err(ProofError::IndexOutOfRange {
            index,
            len: receipts.len(),
        });
    }
    ReceiptTrie::new(receipts)?.prove(index)
}

/// Check that `proof` leads from `root` to `expected_leaf` along its key.
///
/// This replays what the destination chain's verifier does, so a proof that
/// passes here is accepted there against the same root.
pub fn verify(root: B256, proof: &InclusionProof, expected_leaf: &[u8]) -> Result<(), ProofError> {
    if proof.nodes.is_empty() {
        return Err(ProofError::Malformed("proof has no nodes".into()));
    }
    verify_proof(
        root,
        Nibbles::unpack(&proof.key),
        Some(expected_leaf.to_vec()),
        &proof.nodes,
    )
    .map_err(|e| ProofError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::consensus::ReceiptEnvelope;
    use alloy::eips::eip2718::Encodable2718;
    use alloy::primitives::keccak256;

    fn receipt(i: u64, tx_type: u8) -> Receipt {
        Receipt {
            tx_type,
            success: i % 3 != 0,
            cumulative_gas_used: 21_000 * (i + 1),
            logs_bloom: Bloom::repeat_byte((i % 255) as u8),
            logs: vec![ReceiptLog {
                address: Address::repeat_byte(0x11),
                topics: vec![B256::repeat_byte(i as u8)],
                data: Bytes::from(vec![i as u8; 40]),
            }],
        }
    }

    fn receipts(n: u64) -> Vec<Receipt> {
        (0..n).map(|i| receipt(i, (i % 3) as u8)).collect()
    }

    #[test]
    fn test_encode_index() {
        assert_eq!(encode_index(0), vec![0x80]);
        assert_eq!(encode_index(1), vec![0x01]);
        assert_eq!(encode_index(127), vec![0x7f]);
        assert_eq!(encode_index(128), vec![0x81, 0x80]);
        assert_eq!(encode_index(256), vec![0x82, 0x01, 0x00]);
    }

    #[test]
    fn test_key_path_expands_nibbles() {
        assert_eq!(key_path(&[0x81, 0x80], 3), vec![8, 1, 8, 0]);
        assert_eq!(key_path(&[0x80], 1), vec![0x80]);
    }

    #[test]
    fn test_typed_receipt_prefixed() {
        let legacy = receipt(1, 0).encode_2718().unwrap();
        let typed = receipt(1, 2).encode_2718().unwrap();
        assert_eq!(typed[0], 0x02);
        assert_eq!(&typed[1..], legacy.as_slice());
        assert!(legacy[0] >= 0xc0);
    }

    #[test]
    fn test_matches_receipt_envelope() {
        let legacy = receipt(4, 0);
        assert_eq!(
            legacy.encode_2718().unwrap(),
            ReceiptEnvelope::Legacy(legacy.to_consensus()).encoded_2718()
        );
        let dynamic = receipt(5, 2);
        assert_eq!(
            dynamic.encode_2718().unwrap(),
            ReceiptEnvelope::Eip1559(dynamic.to_consensus()).encoded_2718()
        );
    }

    #[test]
    fn test_status_encoding() {
        let mut r = receipt(1, 0);
        r.success = false;
        let encoded = r.encode_2718().unwrap();
        let mut buf = encoded.as_slice();
        let header = alloy_rlp::Header::decode(&mut buf).unwrap();
        assert!(header.list);
        assert_eq!(buf[0], 0x80);
    }

    #[test]
    fn test_rejects_out_of_range_type() {
        let err = receipt(1, 0x80).encode_2718().unwrap_err();
        assert_eq!(err, ProofError::UnsupportedTxType(0x80));
        assert!(build_proof(&[receipt(1, 0x80)], 0).is_err());
        // chain-specific types below 0x80 are proven like any other
        assert_eq!(receipt(1, 0x7e).encode_2718().unwrap()[0], 0x7e);
    }

    #[test]
    fn test_empty_receipts() {
        assert_eq!(build_proof(&[], 0).unwrap_err(), ProofError::EmptyReceipts);
        assert_eq!(ReceiptTrie::new(&[]).unwrap().root(), EMPTY_ROOT_HASH);
    }

    #[test]
    fn test_index_out_of_range() {
        let err = build_proof(&receipts(3), 3).unwrap_err();
        assert_eq!(err, ProofError::IndexOutOfRange { index: 3, len: 3 });
    }

    #[test]
    fn test_single_receipt_proof() {
        let rs = receipts(1);
        let proof = build_proof(&rs, 0).unwrap();
        assert_eq!(proof.nodes.len(), 1);
        assert_eq!(proof.key_path.as_ref(), &[0x80]);
        verify(proof.root, &proof, &rs[0].encode_2718().unwrap()).unwrap();
    }

    #[test]
    fn test_round_trip_every_index() {
        // 130 receipts puts keys on both sides of the 0x7f/0x81 boundary
        let rs = receipts(130);
        let trie = ReceiptTrie::new(&rs).unwrap();
        for i in [0usize, 1, 15, 16, 127, 128, 129] {
            let proof = trie.prove(i).unwrap();
            assert_eq!(proof.root, trie.root());
            assert_eq!(proof.key.as_ref(), encode_index(i).as_slice());
            assert!(proof.nodes.len() > 1);
            let leaf = rs[i].encode_2718().unwrap();
            assert_eq!(trie.leaf(i).unwrap(), leaf.as_slice());
            verify(trie.root(), &proof, &leaf).unwrap_or_else(|e| panic!("index {i}: {e}"));
        }
    }

    #[test]
    fn test_root_independent_of_proof_target() {
        let rs = receipts(20);
        let a = build_proof(&rs, 2).unwrap();
        let b = build_proof(&rs, 17).unwrap();
        assert_eq!(a.root, b.root);
        assert_eq!(a.nodes[0], b.nodes[0]);
        assert_eq!(keccak256(&a.nodes[0]), a.root);
    }

    #[test]
    fn test_verify_rejects_wrong_root() {
        let rs = receipts(5);
        let proof = build_proof(&rs, 2).unwrap();
        let leaf = rs[2].encode_2718().unwrap();
        assert!(verify(B256::repeat_byte(0xaa), &proof, &leaf).is_err());
    }

    #[test]
    fn test_verify_rejects_tampered_node() {
        let rs = receipts(5);
        let mut proof = build_proof(&rs, 2).unwrap();
        let last = proof.nodes.len() - 1;
        let mut tampered = proof.nodes[last].to_vec();
        let n = tampered.len();
        tampered[n - 1] ^= 0xff;
        proof.nodes[last] = Bytes::from(tampered);
        let leaf = rs[2].encode_2718().unwrap();
        assert!(verify(proof.root, &proof, &leaf).is_err());
    }

    #[test]
    fn test_verify_rejects_other_leaf() {
        let rs = receipts(5);
        let mut proof = build_proof(&rs, 2).unwrap();
        assert!(verify(proof.root, &proof, &rs[3].encode_2718().unwrap()).is_err());

        proof.key = Bytes::from(encode_index(3));
        assert!(verify(proof.root, &proof, &rs[2].encode_2718().unwrap()).is_err());
    }
}
