//! Typed values for hashing and contract calls.
//!
//! `AbiValue` is the (type, value) pair used to build canonical pre-hash encodings.
//! Two encodings are provided: the packed form hashed by `solidity_sha3`, which must
//! match `abi.encodePacked` byte for byte, and the standard head/tail form used for
//! call data and return data on the JSON-RPC transport.

use crate::error::{Result, SdkError};
use crate::primitives::{Address, Bytes32, Bytes4};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;

const WORD: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbiType {
    #[serde(rename = "address")]
    Address,
    #[serde(rename = "bytes32")]
    Bytes32,
    #[serde(rename = "bytes4")]
    Bytes4,
    #[serde(rename = "uint256")]
    Uint256,
    #[serde(rename = "uint8")]
    Uint8,
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "string")]
    String,
    #[serde(rename = "bytes")]
    Bytes,
    #[serde(rename = "address[]")]
    AddressArray,
    #[serde(rename = "bytes32[]")]
    Bytes32Array,
    #[serde(rename = "bytes4[]")]
    Bytes4Array,
    #[serde(rename = "uint256[]")]
    Uint256Array,
}

impl AbiType {
    pub fn name(&self) -> &'static str {
        match self {
            AbiType::Address => "address",
            AbiType::Bytes32 => "bytes32",
            AbiType::Bytes4 => "bytes4",
            AbiType::Uint256 => "uint256",
            AbiType::Uint8 => "uint8",
            AbiType::Bool => "bool",
            AbiType::String => "string",
            AbiType::Bytes => "bytes",
            AbiType::AddressArray => "address[]",
            AbiType::Bytes32Array => "bytes32[]",
            AbiType::Bytes4Array => "bytes4[]",
            AbiType::Uint256Array => "uint256[]",
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(
            self,
            AbiType::String
                | AbiType::Bytes
                | AbiType::AddressArray
                | AbiType::Bytes32Array
                | AbiType::Bytes4Array
                | AbiType::Uint256Array
        )
    }

    pub fn parse(name: &str) -> Result<Self> {
        let ty = match name {
            "address" => AbiType::Address,
            "bytes32" => AbiType::Bytes32,
            "bytes4" => AbiType::Bytes4,
            "uint256" | "uint" => AbiType::Uint256,
            "uint8" => AbiType::Uint8,
            "bool" => AbiType::Bool,
            "string" => AbiType::String,
            "bytes" => AbiType::Bytes,
            "address[]" => AbiType::AddressArray,
            "bytes32[]" => AbiType::Bytes32Array,
            "bytes4[]" => AbiType::Bytes4Array,
            "uint256[]" | "uint[]" => AbiType::Uint256Array,
            other => return Err(SdkError::Abi(format!("unsupported ABI type '{}'", other))),
        };
        Ok(ty)
    }
}

impl fmt::Display for AbiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed value. Serialises as `{"type": "...", "value": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum AbiValue {
    #[serde(rename = "address")]
    Address(Address),
    #[serde(rename = "bytes32")]
    Bytes32(Bytes32),
    #[serde(rename = "bytes4")]
    Bytes4(Bytes4),
    #[serde(rename = "uint256")]
    Uint256(u128),
    #[serde(rename = "uint8")]
    Uint8(u8),
    #[serde(rename = "bool")]
    Bool(bool),
    #[serde(rename = "string")]
    String(String),
    #[serde(rename = "bytes")]
    Bytes(#[serde(with = "hex_vec")] Vec<u8>),
    #[serde(rename = "address[]")]
    AddressArray(Vec<Address>),
    #[serde(rename = "bytes32[]")]
    Bytes32Array(Vec<Bytes32>),
    #[serde(rename = "bytes4[]")]
    Bytes4Array(Vec<Bytes4>),
    #[serde(rename = "uint256[]")]
    Uint256Array(Vec<u128>),
}

impl AbiValue {
    pub fn abi_type(&self) -> AbiType {
        match self {
            AbiValue::Address(_) => AbiType::Address,
            AbiValue::Bytes32(_) => AbiType::Bytes32,
            AbiValue::Bytes4(_) => AbiType::Bytes4,
            AbiValue::Uint256(_) => AbiType::Uint256,
            AbiValue::Uint8(_) => AbiType::Uint8,
            AbiValue::Bool(_) => AbiType::Bool,
            AbiValue::String(_) => AbiType::String,
            AbiValue::Bytes(_) => AbiType::Bytes,
            AbiValue::AddressArray(_) => AbiType::AddressArray,
            AbiValue::Bytes32Array(_) => AbiType::Bytes32Array,
            AbiValue::Bytes4Array(_) => AbiType::Bytes4Array,
            AbiValue::Uint256Array(_) => AbiType::Uint256Array,
        }
    }

    /// Builds a value of the given type from its JSON form, as found in DDO condition
    /// parameters: hex strings for addresses and byte arrays, numbers or decimal
    /// strings for integers.
    pub fn from_json(ty: AbiType, value: &serde_json::Value) -> Result<Self> {
        let bad = || SdkError::Abi(format!("cannot read {} from {}", ty, value));
        let as_str = || value.as_str().ok_or_else(bad);
        let as_uint = |v: &serde_json::Value| -> Result<u128> {
            match v {
                serde_json::Value::Number(n) => n.as_u64().map(u128::from).ok_or_else(bad),
                serde_json::Value::String(s) => s.trim().parse::<u128>().map_err(|_| bad()),
                _ => Err(bad()),
            }
        };
        let as_array = || value.as_array().ok_or_else(bad);

        let parsed = match ty {
            AbiType::Address => AbiValue::Address(as_str()?.parse()?),
            AbiType::Bytes32 => AbiValue::Bytes32(as_str()?.parse()?),
            AbiType::Bytes4 => AbiValue::Bytes4(as_str()?.parse()?),
            AbiType::Uint256 => AbiValue::Uint256(as_uint(value)?),
            AbiType::Uint8 => {
                let n = as_uint(value)?;
                AbiValue::Uint8(u8::try_from(n).map_err(|_| bad())?)
            }
            AbiType::Bool => AbiValue::Bool(value.as_bool().ok_or_else(bad)?),
            AbiType::String => AbiValue::String(as_str()?.to_string()),
            AbiType::Bytes => AbiValue::Bytes(hex::decode(crate::primitives::strip_0x(as_str()?))?),
            AbiType::AddressArray => AbiValue::AddressArray(
                as_array()?
                    .iter()
                    .map(|v| v.as_str().ok_or_else(bad)?.parse())
                    .collect::<Result<_>>()?,
            ),
            AbiType::Bytes32Array => AbiValue::Bytes32Array(
                as_array()?
                    .iter()
                    .map(|v| v.as_str().ok_or_else(bad)?.parse())
                    .collect::<Result<_>>()?,
            ),
            AbiType::Bytes4Array => AbiValue::Bytes4Array(
                as_array()?
                    .iter()
                    .map(|v| v.as_str().ok_or_else(bad)?.parse())
                    .collect::<Result<_>>()?,
            ),
            AbiType::Uint256Array => {
                AbiValue::Uint256Array(as_array()?.iter().map(as_uint).collect::<Result<_>>()?)
            }
        };
        Ok(parsed)
    }

    /// JSON form accepted by [`AbiValue::from_json`].
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            AbiValue::Address(a) => json!(a.to_hex()),
            AbiValue::Bytes32(b) => json!(b.to_hex()),
            AbiValue::Bytes4(b) => json!(b.to_hex()),
            AbiValue::Uint256(n) => json!(n.to_string()),
            AbiValue::Uint8(n) => json!(n),
            AbiValue::Bool(b) => json!(b),
            AbiValue::String(s) => json!(s),
            AbiValue::Bytes(b) => json!(format!("0x{}", hex::encode(b))),
            AbiValue::AddressArray(v) => json!(v.iter().map(|a| a.to_hex()).collect::<Vec<_>>()),
            AbiValue::Bytes32Array(v) => json!(v.iter().map(|a| a.to_hex()).collect::<Vec<_>>()),
            AbiValue::Bytes4Array(v) => json!(v.iter().map(|a| a.to_hex()).collect::<Vec<_>>()),
            AbiValue::Uint256Array(v) => json!(v.iter().map(|n| n.to_string()).collect::<Vec<_>>()),
        }
    }

    pub fn as_address(&self) -> Option<Address> {
        match self {
            AbiValue::Address(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_bytes32(&self) -> Option<Bytes32> {
        match self {
            AbiValue::Bytes32(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u128> {
        match self {
            AbiValue::Uint256(n) => Some(*n),
            AbiValue::Uint8(n) => Some(u128::from(*n)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AbiValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AbiValue::String(s) => Some(s),
            _ => None,
        }
    }
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// `abi.encodePacked` of the values in order.
pub fn encode_packed(values: &[AbiValue]) -> Vec<u8> {
    let mut out = Vec::new();
    for value in values {
        match value {
            AbiValue::Address(a) => out.extend_from_slice(a.as_bytes()),
            AbiValue::Bytes32(b) => out.extend_from_slice(b.as_bytes()),
            AbiValue::Bytes4(b) => out.extend_from_slice(b.as_bytes()),
            AbiValue::Uint256(n) => out.extend_from_slice(&uint_word(*n)),
            AbiValue::Uint8(n) => out.push(*n),
            AbiValue::Bool(b) => out.push(u8::from(*b)),
            AbiValue::String(s) => out.extend_from_slice(s.as_bytes()),
            AbiValue::Bytes(b) => out.extend_from_slice(b),
            // array elements are padded to a full word even in packed mode
            AbiValue::AddressArray(v) => v.iter().for_each(|a| out.extend_from_slice(&address_word(a))),
            AbiValue::Bytes32Array(v) => v.iter().for_each(|b| out.extend_from_slice(b.as_bytes())),
            AbiValue::Bytes4Array(v) => v.iter().for_each(|b| out.extend_from_slice(&bytes4_word(b))),
            AbiValue::Uint256Array(v) => v.iter().for_each(|n| out.extend_from_slice(&uint_word(*n))),
        }
    }
    out
}

/// keccak256 over the packed encoding, as computed by `soliditySha3`.
pub fn solidity_sha3(values: &[AbiValue]) -> Bytes32 {
    Bytes32(keccak256(&encode_packed(values)))
}

/// Canonical signature, e.g. `fulfill(bytes32,address,uint256)`.
pub fn method_signature(name: &str, inputs: &[AbiType]) -> String {
    let types: Vec<&str> = inputs.iter().map(AbiType::name).collect();
    format!("{}({})", name, types.join(","))
}

/// First four bytes of the keccak of the canonical signature.
pub fn selector(name: &str, inputs: &[AbiType]) -> Bytes4 {
    let hash = keccak256(method_signature(name, inputs).as_bytes());
    Bytes4([hash[0], hash[1], hash[2], hash[3]])
}

/// Standard ABI encoding of a parameter tuple.
pub fn encode(values: &[AbiValue]) -> Vec<u8> {
    let head_len = values.len() * WORD;
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for value in values {
        if value.abi_type().is_dynamic() {
            head.extend_from_slice(&uint_word((head_len + tail.len()) as u128));
            tail.extend_from_slice(&encode_dynamic(value));
        } else {
            head.extend_from_slice(&encode_static(value));
        }
    }

    head.extend_from_slice(&tail);
    head
}

/// Selector followed by the encoded arguments.
pub fn encode_call(method: &str, args: &[AbiValue]) -> Vec<u8> {
    let types: Vec<AbiType> = args.iter().map(AbiValue::abi_type).collect();
    let mut data = selector(method, &types).0.to_vec();
    data.extend_from_slice(&encode(args));
    data
}

/// Decodes a parameter tuple of the given types.
pub fn decode(types: &[AbiType], data: &[u8]) -> Result<Vec<AbiValue>> {
    types
        .iter()
        .enumerate()
        .map(|(i, ty)| {
            let word = read_word(data, i * WORD)?;
            if ty.is_dynamic() {
                let offset = word_to_usize(&word)?;
                decode_dynamic(*ty, data, offset)
            } else {
                decode_static(*ty, &word)
            }
        })
        .collect()
}

/// Decodes a single static value from a 32-byte word, e.g. an indexed event topic.
pub fn decode_word(ty: AbiType, word: &[u8; 32]) -> Result<AbiValue> {
    if ty.is_dynamic() {
        return Err(SdkError::Abi(format!("{} is not a single-word type", ty)));
    }
    decode_static(ty, word)
}

fn encode_static(value: &AbiValue) -> [u8; 32] {
    match value {
        AbiValue::Address(a) => address_word(a),
        AbiValue::Bytes32(b) => b.0,
        AbiValue::Bytes4(b) => bytes4_word(b),
        AbiValue::Uint256(n) => uint_word(*n),
        AbiValue::Uint8(n) => uint_word(u128::from(*n)),
        AbiValue::Bool(b) => uint_word(u128::from(*b)),
        _ => [0u8; 32],
    }
}

fn encode_dynamic(value: &AbiValue) -> Vec<u8> {
    let mut out = Vec::new();
    match value {
        AbiValue::String(s) => push_padded_bytes(&mut out, s.as_bytes()),
        AbiValue::Bytes(b) => push_padded_bytes(&mut out, b),
        AbiValue::AddressArray(v) => {
            out.extend_from_slice(&uint_word(v.len() as u128));
            v.iter().for_each(|a| out.extend_from_slice(&address_word(a)));
        }
        AbiValue::Bytes32Array(v) => {
            out.extend_from_slice(&uint_word(v.len() as u128));
            v.iter().for_each(|b| out.extend_from_slice(b.as_bytes()));
        }
        AbiValue::Bytes4Array(v) => {
            out.extend_from_slice(&uint_word(v.len() as u128));
            v.iter().for_each(|b| out.extend_from_slice(&bytes4_word(b)));
        }
        AbiValue::Uint256Array(v) => {
            out.extend_from_slice(&uint_word(v.len() as u128));
            v.iter().for_each(|n| out.extend_from_slice(&uint_word(*n)));
        }
        other => out.extend_from_slice(&encode_static(other)),
    }
    out
}

fn push_padded_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&uint_word(bytes.len() as u128));
    out.extend_from_slice(bytes);
    let rem = bytes.len() % WORD;
    if rem != 0 {
        out.extend(std::iter::repeat(0u8).take(WORD - rem));
    }
}

fn decode_static(ty: AbiType, word: &[u8; 32]) -> Result<AbiValue> {
    let value = match ty {
        AbiType::Address => AbiValue::Address(Address::from_slice(&word[12..])?),
        AbiType::Bytes32 => AbiValue::Bytes32(Bytes32(*word)),
        AbiType::Bytes4 => AbiValue::Bytes4(Bytes4::from_slice(&word[..4])?),
        AbiType::Uint256 => AbiValue::Uint256(word_to_u128(word)?),
        AbiType::Uint8 => {
            let n = word_to_u128(word)?;
            AbiValue::Uint8(u8::try_from(n).map_err(|_| SdkError::Abi(format!("{} overflows uint8", n)))?)
        }
        AbiType::Bool => AbiValue::Bool(word_to_u128(word)? != 0),
        dynamic => return Err(SdkError::Abi(format!("{} is dynamic", dynamic))),
    };
    Ok(value)
}

fn decode_dynamic(ty: AbiType, data: &[u8], offset: usize) -> Result<AbiValue> {
    let len = word_to_usize(&read_word(data, offset)?)?;
    let body = offset + WORD;

    let words = |decode_one: &dyn Fn(&[u8; 32]) -> Result<AbiValue>| -> Result<Vec<AbiValue>> {
        (0..len)
            .map(|i| decode_one(&read_word(data, body + i * WORD)?))
            .collect()
    };

    let value = match ty {
        AbiType::String | AbiType::Bytes => {
            let end = body
                .checked_add(len)
                .filter(|end| *end <= data.len())
                .ok_or_else(|| SdkError::Abi("dynamic bytes run past end of data".to_string()))?;
            let raw = data[body..end].to_vec();
            if ty == AbiType::String {
                AbiValue::String(
                    String::from_utf8(raw).map_err(|e| SdkError::Abi(format!("invalid utf-8: {}", e)))?,
                )
            } else {
                AbiValue::Bytes(raw)
            }
        }
        AbiType::AddressArray => AbiValue::AddressArray(
            words(&|w| decode_static(AbiType::Address, w))?
                .into_iter()
                .filter_map(|v| v.as_address())
                .collect(),
        ),
        AbiType::Bytes32Array => AbiValue::Bytes32Array(
            words(&|w| decode_static(AbiType::Bytes32, w))?
                .into_iter()
                .filter_map(|v| v.as_bytes32())
                .collect(),
        ),
        AbiType::Bytes4Array => {
            let mut out = Vec::with_capacity(len);
            for i in 0..len {
                let w = read_word(data, body + i * WORD)?;
                out.push(Bytes4::from_slice(&w[..4])?);
            }
            AbiValue::Bytes4Array(out)
        }
        AbiType::Uint256Array => AbiValue::Uint256Array(
            words(&|w| decode_static(AbiType::Uint256, w))?
                .into_iter()
                .filter_map(|v| v.as_uint())
                .collect(),
        ),
        fixed => return Err(SdkError::Abi(format!("{} is not dynamic", fixed))),
    };
    Ok(value)
}

fn read_word(data: &[u8], offset: usize) -> Result<[u8; 32]> {
    let end = offset
        .checked_add(WORD)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| SdkError::Abi(format!("no word at offset {} (data is {} bytes)", offset, data.len())))?;
    let mut word = [0u8; 32];
    word.copy_from_slice(&data[offset..end]);
    Ok(word)
}

fn word_to_u128(word: &[u8; 32]) -> Result<u128> {
    if word[..16].iter().any(|b| *b != 0) {
        return Err(SdkError::Abi("uint256 value exceeds u128".to_string()));
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(low))
}

fn word_to_usize(word: &[u8; 32]) -> Result<usize> {
    let n = word_to_u128(word)?;
    usize::try_from(n).map_err(|_| SdkError::Abi(format!("offset {} too large", n)))
}

fn uint_word(n: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&n.to_be_bytes());
    word
}

fn address_word(a: &Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(a.as_bytes());
    word
}

fn bytes4_word(b: &Bytes4) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[..4].copy_from_slice(b.as_bytes());
    word
}

mod hex_vec {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(crate::primitives::strip_0x(&s)).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak_of_empty_input() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_selector_of_known_signature() {
        // transfer(address,uint256) => a9059cbb
        let sel = selector("transfer", &[AbiType::Address, AbiType::Uint256]);
        assert_eq!(sel.to_plain_hex(), "a9059cbb");
    }

    #[test]
    fn test_packed_scalar_widths() {
        let packed = encode_packed(&[
            AbiValue::Address(Address([1u8; 20])),
            AbiValue::Uint8(2),
            AbiValue::Bool(true),
            AbiValue::Uint256(3),
        ]);
        assert_eq!(packed.len(), 20 + 1 + 1 + 32);
        assert_eq!(packed[20], 2);
        assert_eq!(packed[21], 1);
        assert_eq!(packed[packed.len() - 1], 3);
    }

    #[test]
    fn test_packed_arrays_pad_each_element() {
        let packed = encode_packed(&[AbiValue::AddressArray(vec![Address([0xaa; 20]); 2])]);
        assert_eq!(packed.len(), 64);
        assert!(packed[..12].iter().all(|b| *b == 0));
        assert_eq!(packed[12], 0xaa);
    }

    #[test]
    fn test_solidity_sha3_is_order_sensitive() {
        let a = AbiValue::Bytes32(Bytes32([1u8; 32]));
        let b = AbiValue::Bytes32(Bytes32([2u8; 32]));
        assert_ne!(
            solidity_sha3(&[a.clone(), b.clone()]),
            solidity_sha3(&[b, a])
        );
    }

    #[test]
    fn test_standard_encoding_with_dynamic_tail() {
        let values = vec![
            AbiValue::Uint256(7),
            AbiValue::Bytes32Array(vec![Bytes32([9u8; 32])]),
            AbiValue::String("hi".to_string()),
        ];
        let encoded = encode(&values);
        // 3 head words, array (len + 1 word), string (len + 1 padded word)
        assert_eq!(encoded.len(), 32 * 3 + 32 * 2 + 32 * 2);

        let types: Vec<AbiType> = values.iter().map(AbiValue::abi_type).collect();
        assert_eq!(decode(&types, &encoded).unwrap(), values);
    }

    #[test]
    fn test_decode_rejects_truncated_data() {
        assert!(decode(&[AbiType::Uint256], &[0u8; 16]).is_err());
    }

    #[test]
    fn test_json_value_conversion() {
        let v = AbiValue::from_json(AbiType::Uint256, &serde_json::json!("12")).unwrap();
        assert_eq!(v, AbiValue::Uint256(12));
        let v = AbiValue::from_json(AbiType::Uint256, &serde_json::json!(12)).unwrap();
        assert_eq!(v.to_json(), serde_json::json!("12"));
        assert!(AbiValue::from_json(AbiType::Address, &serde_json::json!(12)).is_err());
    }

    #[test]
    fn test_value_pair_serde_shape() {
        let json = serde_json::to_value(AbiValue::Uint8(1)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "uint8", "value": 1}));
    }
}
