pub mod payload;

use std::iter::Peekable;

use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::script::{Instruction, Instructions};
use bitcoin::{Script, Transaction};
use regex::Regex;

use crate::chain::{address_from_output_script, ChainKind};

const PROTOCOL_FLAG: &[u8] = b"metaid";

/// Namespace prefix a `create` pin has to live under to count as a MetaApp.
pub const METAAPP_PROTOCOL_PATH: &str = "/protocols/metaapp";

lazy_static! {
    pub static ref PIN_ID_REGEX: Regex = Regex::new(r#"^[0-9a-f]{64}i\d+$"#).unwrap();
}

/// One decoded inscription output, before any MetaApp interpretation.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPin {
    pub pin_id: String,
    pub vout: u32,
    pub operation: String,
    pub original_path: String,
    pub host: String,
    pub path: String,
    pub parent_path: String,
    pub encryption: String,
    pub version: String,
    pub content_type: String,
    pub content_bytes: Vec<u8>,
    pub owner_address: String,
    /// `"{prev_txid}:{prev_vout}"` of the first input; resolved to a
    /// spendable address by the indexer with one prior-tx lookup.
    pub creator_input_location: String,
    pub chain: ChainKind,
}

#[derive(Debug, PartialEq)]
pub enum EnvelopeError {
    NoEnvelope,
    UnknownFlag,
    IncompleteEnvelope,
    Malformed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawEnvelope {
    pub operation: String,
    pub path: String,
    pub encryption: String,
    pub version: String,
    pub content_type: String,
    pub payload: Vec<u8>,
}

/// Walks the instructions of an output locking script looking for the
/// `OP_FALSE OP_RETURN metaid …` envelope. Payload bytes arrive chunked in
/// successive pushes of at most 520 bytes and are concatenated back.
pub struct EnvelopeParser<'a> {
    instructions: Peekable<Instructions<'a>>,
}

impl<'a> EnvelopeParser<'a> {
    pub fn parse(script: &'a Script) -> Result<RawEnvelope, EnvelopeError> {
        let mut parser = EnvelopeParser {
            instructions: script.instructions().peekable(),
        };
        parser.parse_envelope()
    }

    fn parse_envelope(&mut self) -> Result<RawEnvelope, EnvelopeError> {
        match self.advance()? {
            Instruction::PushBytes(push) if push.is_empty() => {}
            _ => return Err(EnvelopeError::NoEnvelope),
        }
        match self.advance()? {
            Instruction::Op(op) if op == opcodes::all::OP_RETURN => {}
            _ => return Err(EnvelopeError::NoEnvelope),
        }
        if self.expect_push()? != PROTOCOL_FLAG {
            return Err(EnvelopeError::UnknownFlag);
        }

        let operation = self.expect_field()?;
        let path = self.expect_field()?;
        let encryption = self.expect_field()?;
        let version = self.expect_field()?;
        let content_type = self.expect_field()?;

        let mut payload = vec![];
        while let Some(instruction) = self.instructions.next() {
            match instruction.map_err(|_| EnvelopeError::Malformed)? {
                Instruction::PushBytes(push) => payload.extend_from_slice(push.as_bytes()),
                Instruction::Op(_) => break,
            }
        }

        Ok(RawEnvelope {
            operation: operation.to_lowercase(),
            path,
            encryption,
            version,
            content_type,
            payload,
        })
    }

    fn advance(&mut self) -> Result<Instruction<'a>, EnvelopeError> {
        self.instructions
            .next()
            .ok_or(EnvelopeError::IncompleteEnvelope)?
            .map_err(|_| EnvelopeError::Malformed)
    }

    fn expect_push(&mut self) -> Result<Vec<u8>, EnvelopeError> {
        match self.advance()? {
            Instruction::PushBytes(push) => Ok(push.as_bytes().to_vec()),
            Instruction::Op(_) => Err(EnvelopeError::IncompleteEnvelope),
        }
    }

    fn expect_field(&mut self) -> Result<String, EnvelopeError> {
        let bytes = self.expect_push()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Decodes every inscription output of a transaction. `txid` is the display
/// txid computed by the chain codec (the variants disagree on it).
pub fn decode_transaction_pins(
    tx: &Transaction,
    txid: &str,
    chain: ChainKind,
) -> Vec<DecodedPin> {
    let creator_input_location = tx
        .input
        .first()
        .map(|input| {
            format!(
                "{}:{}",
                input.previous_output.txid, input.previous_output.vout
            )
        })
        .unwrap_or_default();
    let owner_address = tx
        .output
        .iter()
        .find_map(|output| address_from_output_script(&output.script_pubkey).ok())
        .unwrap_or_default();

    let mut pins = vec![];
    for (vout, output) in tx.output.iter().enumerate() {
        let envelope = match EnvelopeParser::parse(&output.script_pubkey) {
            Ok(envelope) => envelope,
            Err(_) => continue,
        };
        let (host, path) = split_host(&envelope.path);
        let parent_path = parent_of(&path);
        pins.push(DecodedPin {
            pin_id: format!("{}i{}", txid, vout),
            vout: vout as u32,
            operation: envelope.operation,
            original_path: envelope.path,
            host,
            parent_path,
            path,
            encryption: envelope.encryption,
            version: envelope.version,
            content_type: envelope.content_type,
            content_bytes: envelope.payload,
            owner_address: owner_address.clone(),
            creator_input_location: creator_input_location.clone(),
            chain,
        });
    }
    pins
}

/// A path is a MetaApp when it lives under the protocol namespace, or when
/// it is an `@`-reference to an ancestor pin (`@{pin_id}` or
/// `{host:@pin_id}`). The second flag reports the reference form.
pub fn is_metaapp_path(path: &str) -> (bool, bool) {
    if path.is_empty() {
        return (false, false);
    }
    if path.starts_with(METAAPP_PROTOCOL_PATH) || path.contains(METAAPP_PROTOCOL_PATH) {
        return (true, false);
    }
    if path.starts_with('@') {
        return (true, true);
    }
    if let Some(reference) = path.rsplit('@').next() {
        if path.contains('@') && PIN_ID_REGEX.is_match(reference.trim_end_matches('}')) {
            return (true, true);
        }
    }
    (false, false)
}

/// Pulls the referenced parent pin id out of a modify path.
pub fn extract_parent_pin_id(path: &str) -> Option<String> {
    if let Some(rest) = path.strip_prefix('@') {
        if rest.is_empty() {
            return None;
        }
        return Some(rest.trim_end_matches('}').to_string());
    }
    if path.contains('@') {
        let reference = path.rsplit('@').next()?.trim_end_matches('}');
        if PIN_ID_REGEX.is_match(reference) {
            return Some(reference.to_string());
        }
    }
    None
}

fn split_host(original_path: &str) -> (String, String) {
    if original_path.starts_with('@') || original_path.starts_with('/') {
        return (String::new(), original_path.to_string());
    }
    match original_path.split_once(':') {
        Some((host, rest)) => (
            host.trim_start_matches('{').to_string(),
            rest.trim_end_matches('}').to_string(),
        ),
        None => (String::new(), original_path.to_string()),
    }
}

fn parent_of(path: &str) -> String {
    if path.starts_with('@') {
        return String::new();
    }
    match path.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
pub(crate) mod test {
    use bitcoin::absolute::LockTime;
    use bitcoin::blockdata::opcodes;
    use bitcoin::script::{Builder, PushBytesBuf};
    use bitcoin::transaction::Version;
    use bitcoin::{
        Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
    };
    use bitcoin::hashes::Hash;

    use super::*;

    pub(crate) fn inscription_script(
        operation: &str,
        path: &str,
        content_type: &str,
        payload: &[u8],
    ) -> ScriptBuf {
        let mut builder = Builder::new()
            .push_opcode(opcodes::OP_FALSE)
            .push_opcode(opcodes::all::OP_RETURN)
            .push_slice(PushBytesBuf::try_from(b"metaid".to_vec()).unwrap())
            .push_slice(PushBytesBuf::try_from(operation.as_bytes().to_vec()).unwrap())
            .push_slice(PushBytesBuf::try_from(path.as_bytes().to_vec()).unwrap())
            .push_slice(PushBytesBuf::try_from(b"0".to_vec()).unwrap())
            .push_slice(PushBytesBuf::try_from(b"1.0.0".to_vec()).unwrap())
            .push_slice(PushBytesBuf::try_from(content_type.as_bytes().to_vec()).unwrap());
        for chunk in payload.chunks(520) {
            builder = builder.push_slice(PushBytesBuf::try_from(chunk.to_vec()).unwrap());
        }
        builder.into_script()
    }

    pub(crate) fn inscription_transaction(script: ScriptBuf) -> Transaction {
        Transaction {
            version: Version(10),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_byte_array([0x42; 32]),
                    vout: 3,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(0),
                script_pubkey: script,
            }],
        }
    }

    #[test]
    fn envelope_round_trips_through_script() {
        let script = inscription_script(
            "create",
            "/protocols/metaapp",
            "application/json",
            br#"{"title":"demo"}"#,
        );
        let envelope = EnvelopeParser::parse(&script).unwrap();
        assert_eq!(envelope.operation, "create");
        assert_eq!(envelope.path, "/protocols/metaapp");
        assert_eq!(envelope.content_type, "application/json");
        assert_eq!(envelope.payload, br#"{"title":"demo"}"#.to_vec());
    }

    #[test]
    fn oversized_payload_chunks_are_reassembled() {
        let payload = vec![0x5a; 1500];
        let script = inscription_script("create", "/protocols/metaapp", "application/json", &payload);
        let envelope = EnvelopeParser::parse(&script).unwrap();
        assert_eq!(envelope.payload, payload);
    }

    #[test]
    fn plain_p2pkh_output_carries_no_envelope() {
        let script = ScriptBuf::new_p2pkh(&bitcoin::PubkeyHash::from_byte_array([0x07; 20]));
        assert_eq!(
            EnvelopeParser::parse(&script).unwrap_err(),
            EnvelopeError::NoEnvelope
        );
    }

    #[test]
    fn foreign_flag_is_skipped() {
        let script = Builder::new()
            .push_opcode(opcodes::OP_FALSE)
            .push_opcode(opcodes::all::OP_RETURN)
            .push_slice(PushBytesBuf::try_from(b"ord".to_vec()).unwrap())
            .into_script();
        assert_eq!(
            EnvelopeParser::parse(&script).unwrap_err(),
            EnvelopeError::UnknownFlag
        );
    }

    #[test]
    fn truncated_envelope_is_incomplete() {
        let script = Builder::new()
            .push_opcode(opcodes::OP_FALSE)
            .push_opcode(opcodes::all::OP_RETURN)
            .push_slice(PushBytesBuf::try_from(b"metaid".to_vec()).unwrap())
            .push_slice(PushBytesBuf::try_from(b"create".to_vec()).unwrap())
            .into_script();
        assert_eq!(
            EnvelopeParser::parse(&script).unwrap_err(),
            EnvelopeError::IncompleteEnvelope
        );
    }

    #[test]
    fn decoded_pin_carries_identity_and_creator_location() {
        let script = inscription_script("create", "/protocols/metaapp", "application/json", b"{}");
        let tx = inscription_transaction(script);
        let txid = "ab".repeat(32);
        let pins = decode_transaction_pins(&tx, &txid, ChainKind::Mvc);
        assert_eq!(pins.len(), 1);
        assert_eq!(pins[0].pin_id, format!("{}i0", txid));
        assert_eq!(pins[0].vout, 0);
        assert!(pins[0].creator_input_location.ends_with(":3"));
    }

    #[test]
    fn metaapp_paths_are_classified() {
        let pin = format!("{}i0", "c".repeat(64));
        assert_eq!(is_metaapp_path("/protocols/metaapp"), (true, false));
        assert_eq!(is_metaapp_path("/protocols/metaapp/sub"), (true, false));
        assert_eq!(is_metaapp_path(&format!("@{}", pin)), (true, true));
        assert_eq!(is_metaapp_path(&format!("{{host:@{}}}", pin)), (true, true));
        assert_eq!(is_metaapp_path("/protocols/simplebuzz"), (false, false));
        assert_eq!(is_metaapp_path(""), (false, false));
    }

    #[test]
    fn parent_pin_reference_is_extracted() {
        let pin = format!("{}i4", "d".repeat(64));
        assert_eq!(extract_parent_pin_id(&format!("@{}", pin)), Some(pin.clone()));
        assert_eq!(
            extract_parent_pin_id(&format!("{{host:@{}}}", pin)),
            Some(pin)
        );
        assert_eq!(extract_parent_pin_id("/protocols/metaapp"), None);
        assert_eq!(extract_parent_pin_id("@"), None);
    }

    #[test]
    fn host_prefix_is_split_off() {
        assert_eq!(
            split_host("metaid.io:/protocols/metaapp"),
            ("metaid.io".to_string(), "/protocols/metaapp".to_string())
        );
        assert_eq!(
            split_host("/protocols/metaapp"),
            (String::new(), "/protocols/metaapp".to_string())
        );
    }

    #[test]
    fn parent_path_is_the_enclosing_namespace() {
        assert_eq!(parent_of("/protocols/metaapp"), "/protocols");
        assert_eq!(parent_of("/protocols"), "");
        assert_eq!(parent_of("@abc"), "");
    }
}
