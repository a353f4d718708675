//! Event decoding against human-readable event signatures.
//!
//! A registration carries a signature such as
//! `Transfer(address indexed from, address indexed to, uint256 value)`.
//! The selector is keccak256 of the canonical form
//! `Transfer(address,address,uint256)`; for non-anonymous events it is `topics[0]`.
//!
//! Decoding rules:
//! - indexed value types (uint, int, bool, address, bytesN) are ABI-decoded
//!   from their 32-byte topic;
//! - indexed reference types (string, bytes, arrays, tuples) are stored as the
//!   keccak256 of their encoding, so the topic hash itself is returned;
//! - non-indexed params are ABI-decoded from `data` as a parameter tuple.

use std::str::FromStr;

use alloy_dyn_abi::{DynSolType, DynSolValue, Specifier};
use alloy_json_abi::Event;
use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tiny_keccak::{Hasher, Keccak};

use crate::error::DecodeError;
use crate::types::{hash_hex, EventLog, LogPosition};

/// keccak256 of an arbitrary byte string.
pub fn keccak256(data: &[u8]) -> B256 {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(data);
    hasher.finalize(&mut output);
    B256::from(output)
}

// ─── EventSignature ───────────────────────────────────────────────────────────

/// One parameter of an event signature.
#[derive(Debug, Clone, PartialEq)]
pub struct EventParam {
    /// Declared name, or `argN` when unnamed.
    pub name: String,
    /// Canonical Solidity type name (`uint256`, `(address,bool)[]`, …).
    pub type_name: String,
    pub ty: DynSolType,
    pub indexed: bool,
}

/// A parsed event signature with its selector.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSignature {
    name: String,
    params: Vec<EventParam>,
    canonical: String,
    selector: B256,
}

impl EventSignature {
    /// Parse a human-readable signature, optionally prefixed with `event`.
    ///
    /// Names inside tuple types (`(address maker, uint256 amount) order`) are
    /// accepted and dropped; decoded tuples are positional.
    pub fn parse(input: &str) -> Result<Self, DecodeError> {
        let invalid = |reason: String| DecodeError::InvalidSignature {
            signature: input.to_string(),
            reason,
        };

        let event = Event::parse(&strip_component_names(input.trim()))
            .map_err(|e| invalid(e.to_string()))?;
        if event.anonymous {
            return Err(invalid("anonymous events carry no selector topic".into()));
        }
        if event.num_topics() > 4 {
            return Err(invalid("more than 3 indexed parameters".into()));
        }

        let mut params = Vec::with_capacity(event.inputs.len());
        for (index, param) in event.inputs.iter().enumerate() {
            let type_name = param.selector_type().into_owned();
            let ty = param
                .resolve()
                .map_err(|e| invalid(format!("parameter {index} type '{type_name}': {e}")))?;
            params.push(EventParam {
                name: if param.name.is_empty() {
                    format!("arg{index}")
                } else {
                    param.name.clone()
                },
                type_name,
                ty,
                indexed: param.indexed,
            });
        }

        Ok(Self {
            canonical: event.signature(),
            selector: event.selector(),
            name: event.name,
            params,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[EventParam] {
        &self.params
    }

    /// Canonical form used for hashing, e.g. `Transfer(address,address,uint256)`.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// keccak256 of the canonical form.
    pub fn selector(&self) -> B256 {
        self.selector
    }

    fn indexed_count(&self) -> usize {
        self.params.iter().filter(|p| p.indexed).count()
    }
}

impl FromStr for EventSignature {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for EventSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Remove parameter names from tuple components, which the signature parser
/// only accepts at the top level.
fn strip_component_names(signature: &str) -> String {
    let mut out = String::with_capacity(signature.len());
    let mut depth = 0usize;
    let mut in_name = false;
    for c in signature.chars() {
        match c {
            '(' | ')' | ',' => {
                match c {
                    '(' => depth += 1,
                    ')' => depth = depth.saturating_sub(1),
                    _ => {}
                }
                in_name = false;
                out.push(c);
            }
            c if depth >= 2 && c.is_whitespace() => {
                if !out.ends_with(['(', ',']) {
                    in_name = true;
                }
            }
            _ if in_name => {}
            c => out.push(c),
        }
    }
    out
}

// ─── DecodedEvent ─────────────────────────────────────────────────────────────

/// A log decoded against its registered signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedEvent {
    /// Event name, e.g. `"Transfer"`.
    pub name: String,
    /// Emitting contract.
    pub address: Address,
    pub position: LogPosition,
    pub block_hash: B256,
    pub transaction_hash: Option<B256>,
    /// Decoded parameters keyed by parameter name.
    pub fields: Map<String, Value>,
}

impl DecodedEvent {
    /// Get a field value by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Turns a raw log into a [`DecodedEvent`]. Must be side-effect free.
pub trait EventDecoder: Send + Sync {
    fn decode(&self, log: &EventLog) -> Result<DecodedEvent, DecodeError>;
}

/// Default decoder: ABI decoding driven by an [`EventSignature`].
#[derive(Debug, Clone)]
pub struct AbiDecoder {
    signature: EventSignature,
}

impl AbiDecoder {
    pub fn new(signature: EventSignature) -> Self {
        Self { signature }
    }

    pub fn signature(&self) -> &EventSignature {
        &self.signature
    }

    fn abi_error(&self, reason: impl std::fmt::Display) -> DecodeError {
        DecodeError::Abi {
            event: self.signature.name.clone(),
            reason: reason.to_string(),
        }
    }

    fn decode_topic(&self, topic: &B256, param: &EventParam) -> Result<Value, DecodeError> {
        if is_reference_type(&param.ty) {
            return Ok(Value::String(hash_hex(topic)));
        }
        param
            .ty
            .abi_decode(topic.as_slice())
            .map(to_json)
            .map_err(|e| self.abi_error(format!("topic '{}': {e}", param.name)))
    }

    fn decode_body(&self, data: &[u8]) -> Result<Vec<DynSolValue>, DecodeError> {
        let types: Vec<DynSolType> = self
            .signature
            .params
            .iter()
            .filter(|p| !p.indexed)
            .map(|p| p.ty.clone())
            .collect();
        if types.is_empty() {
            return Ok(Vec::new());
        }
        match DynSolType::Tuple(types)
            .abi_decode_params(data)
            .map_err(|e| self.abi_error(format!("data: {e}")))?
        {
            DynSolValue::Tuple(values) => Ok(values),
            other => Ok(vec![other]),
        }
    }
}

impl EventDecoder for AbiDecoder {
    fn decode(&self, log: &EventLog) -> Result<DecodedEvent, DecodeError> {
        let sig = &self.signature;
        match log.topic0() {
            Some(topic0) if *topic0 == sig.selector => {}
            other => {
                return Err(DecodeError::SelectorMismatch {
                    expected: hash_hex(&sig.selector),
                    actual: other.map_or_else(|| "none".to_string(), hash_hex),
                })
            }
        }

        let expected_topics = sig.indexed_count() + 1;
        if log.topics.len() != expected_topics {
            return Err(DecodeError::TopicCount {
                event: sig.name.clone(),
                expected: expected_topics,
                actual: log.topics.len(),
            });
        }

        let mut topics = log.topics[1..].iter();
        let mut body = self.decode_body(&log.data)?.into_iter();
        let mut fields = Map::new();
        for param in &sig.params {
            let value = if param.indexed {
                match topics.next() {
                    Some(topic) => self.decode_topic(topic, param)?,
                    None => Value::Null,
                }
            } else {
                body.next().map_or(Value::Null, to_json)
            };
            fields.insert(param.name.clone(), value);
        }

        Ok(DecodedEvent {
            name: sig.name.clone(),
            address: log.address,
            position: log.position(),
            block_hash: log.block.hash,
            transaction_hash: log.transaction_hash,
            fields,
        })
    }
}

fn is_reference_type(ty: &DynSolType) -> bool {
    matches!(
        ty,
        DynSolType::String
            | DynSolType::Bytes
            | DynSolType::Array(_)
            | DynSolType::FixedArray(..)
            | DynSolType::Tuple(_)
    )
}

/// Convert a decoded ABI value into JSON.
///
/// Integers that fit in 64 bits become JSON numbers; wider values are decimal
/// strings. Byte values are `0x`-prefixed hex, addresses are EIP-55 checksummed.
fn to_json(value: DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(b),
        DynSolValue::Int(i, _) => match i128::try_from(i).ok().and_then(|v| i64::try_from(v).ok()) {
            Some(v) => Value::from(v),
            None => Value::String(i.to_string()),
        },
        DynSolValue::Uint(u, _) => {
            match u128::try_from(u).ok().and_then(|v| u64::try_from(v).ok()) {
                Some(v) => Value::from(v),
                None => Value::String(u.to_string()),
            }
        }
        DynSolValue::FixedBytes(word, size) => {
            Value::String(format!("0x{}", hex::encode(&word.as_slice()[..size.min(32)])))
        }
        DynSolValue::Address(a) => Value::String(a.to_checksum(None)),
        DynSolValue::Function(f) => Value::String(format!("0x{}", hex::encode(f.to_vec()))),
        DynSolValue::Bytes(b) => Value::String(format!("0x{}", hex::encode(b))),
        DynSolValue::String(s) => Value::String(s),
        DynSolValue::Array(vals) | DynSolValue::FixedArray(vals) | DynSolValue::Tuple(vals) => {
            Value::Array(vals.into_iter().map(to_json).collect())
        }
        #[allow(unreachable_patterns)]
        other => Value::String(format!("{other:?}")),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
