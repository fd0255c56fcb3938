use bitcoin::hashes::{sha256, sha256d, Hash};
use bitcoin::Transaction;

/// Transactions at or above this version hash through the compact pre-image
/// instead of the full serialized bytes.
pub const COMPACT_HASH_MIN_VERSION: i32 = 10;

/// Reads the little-endian version field from raw transaction bytes without
/// deserializing the whole transaction.
pub fn transaction_version(raw: &[u8]) -> Option<i32> {
    if raw.len() < 4 {
        return None;
    }
    Some(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Double-SHA-256 of the compact pre-image, displayed byte-reversed like any
/// other txid.
pub fn compact_txid(tx: &Transaction) -> String {
    let digest = sha256d::Hash::hash(&compact_preimage(tx));
    let mut bytes = digest.to_byte_array();
    bytes.reverse();
    hex::encode(bytes)
}

// Pre-image layout, little-endian throughout:
//   4B version || 4B locktime || 4B input count || 4B output count
//   || SHA256(for each input: 32B prev txid || 4B prev vout || 4B sequence)
//   || SHA256(for each input: SHA256(signature script))
//   || SHA256(for each output: 8B value || SHA256(pk script))
fn compact_preimage(tx: &Transaction) -> Vec<u8> {
    let mut preimage = Vec::with_capacity(112);
    preimage.extend_from_slice(&tx.version.0.to_le_bytes());
    preimage.extend_from_slice(&tx.lock_time.to_consensus_u32().to_le_bytes());
    preimage.extend_from_slice(&(tx.input.len() as u32).to_le_bytes());
    preimage.extend_from_slice(&(tx.output.len() as u32).to_le_bytes());

    let mut outpoints = vec![];
    let mut signature_scripts = vec![];
    for input in tx.input.iter() {
        outpoints.extend_from_slice(&input.previous_output.txid.to_byte_array());
        outpoints.extend_from_slice(&input.previous_output.vout.to_le_bytes());
        outpoints.extend_from_slice(&input.sequence.0.to_le_bytes());
        signature_scripts
            .extend_from_slice(&sha256::Hash::hash(input.script_sig.as_bytes()).to_byte_array());
    }
    preimage.extend_from_slice(&sha256::Hash::hash(&outpoints).to_byte_array());
    preimage.extend_from_slice(&sha256::Hash::hash(&signature_scripts).to_byte_array());

    let mut outputs = vec![];
    for output in tx.output.iter() {
        outputs.extend_from_slice(&output.value.to_sat().to_le_bytes());
        outputs
            .extend_from_slice(&sha256::Hash::hash(output.script_pubkey.as_bytes()).to_byte_array());
    }
    preimage.extend_from_slice(&sha256::Hash::hash(&outputs).to_byte_array());
    preimage
}
