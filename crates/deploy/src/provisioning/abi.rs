//! Solidity ABI encoding of constructor and call arguments, on top of `alloy`'s dynamic ABI.
//!
//! Graph arguments are JSON values. Strings, numbers and booleans are coerced into the
//! declared parameter type; JSON arrays map to Solidity arrays and tuples.

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue},
    primitives::{Address, U256, keccak256},
};
use anyhow::{Context, Result, bail};
use serde_json::{Value, json};

/// Parse a Solidity type such as `address`, `uint` or `(address,uint256)[]`.
pub fn parse_type(ty: &str) -> Result<DynSolType> {
    let compact: String = ty.split_whitespace().collect();
    DynSolType::parse(&compact).with_context(|| format!("invalid ABI type `{ty}`"))
}

/// A parsed method signature such as `updatePool(address,address,string)`.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSignature {
    pub name: String,
    pub inputs: Vec<DynSolType>,
}

impl FunctionSignature {
    pub fn parse(signature: &str) -> Result<Self> {
        let signature = signature.trim();
        let (name, rest) = signature
            .split_once('(')
            .with_context(|| format!("method `{signature}` is not a signature like `name(type,...)`"))?;
        let params = rest
            .strip_suffix(')')
            .with_context(|| format!("method `{signature}` is missing a closing parenthesis"))?;

        let name = name.trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            bail!("invalid method name in `{signature}`");
        }

        let inputs = if params.trim().is_empty() {
            Vec::new()
        } else {
            match parse_type(&format!("({params})"))
                .with_context(|| format!("invalid parameter list in `{signature}`"))?
            {
                DynSolType::Tuple(types) => types,
                single => vec![single],
            }
        };

        Ok(Self {
            name: name.to_string(),
            inputs,
        })
    }

    /// `name(type1,type2)` with every type in canonical form (`uint` becomes `uint256`).
    pub fn canonical(&self) -> String {
        format!(
            "{}{}",
            self.name,
            DynSolType::Tuple(self.inputs.clone()).sol_type_name()
        )
    }

    /// First four bytes of the keccak-256 hash of the canonical signature.
    pub fn selector(&self) -> [u8; 4] {
        let hash = keccak256(self.canonical().as_bytes());
        [hash[0], hash[1], hash[2], hash[3]]
    }
}

/// Encode a call: selector followed by the encoded arguments.
pub fn encode_call(signature: &FunctionSignature, values: &[Value]) -> Result<Vec<u8>> {
    let mut data = signature.selector().to_vec();
    data.extend(
        encode_args(&signature.inputs, values)
            .with_context(|| format!("failed to encode arguments of {}", signature.canonical()))?,
    );
    Ok(data)
}

/// Encode `values` as the parameter list `types`.
pub fn encode_args(types: &[DynSolType], values: &[Value]) -> Result<Vec<u8>> {
    if types.len() != values.len() {
        bail!(
            "expected {} argument(s), got {}",
            types.len(),
            values.len()
        );
    }

    let tokens = types
        .iter()
        .zip(values)
        .enumerate()
        .map(|(position, (ty, value))| {
            coerce(ty, value)
                .with_context(|| format!("argument #{position} ({})", ty.sol_type_name()))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(DynSolValue::Tuple(tokens).abi_encode_params())
}

/// Decode the return data of a call returning a single `ty`.
pub fn decode_output(ty: &DynSolType, data: &[u8]) -> Result<Value> {
    let decoded = DynSolType::Tuple(vec![ty.clone()])
        .abi_decode_params(data)
        .with_context(|| {
            format!(
                "return data 0x{} is not a valid {}",
                hex::encode(data),
                ty.sol_type_name()
            )
        })?;

    match decoded {
        DynSolValue::Tuple(mut values) if values.len() == 1 => Ok(to_json(&values.remove(0))),
        other => Ok(to_json(&other)),
    }
}

fn coerce(ty: &DynSolType, value: &Value) -> Result<DynSolValue> {
    match (ty, value) {
        (DynSolType::Array(inner), Value::Array(items)) => Ok(DynSolValue::Array(
            items
                .iter()
                .map(|item| coerce(inner, item))
                .collect::<Result<_>>()?,
        )),
        (DynSolType::FixedArray(inner, len), Value::Array(items)) => {
            if items.len() != *len {
                bail!("expected {len} element(s), got {}", items.len());
            }
            Ok(DynSolValue::FixedArray(
                items
                    .iter()
                    .map(|item| coerce(inner, item))
                    .collect::<Result<_>>()?,
            ))
        }
        (DynSolType::Tuple(types), Value::Array(items)) => {
            if items.len() != types.len() {
                bail!("expected a tuple of {}, got {} value(s)", types.len(), items.len());
            }
            Ok(DynSolValue::Tuple(
                types
                    .iter()
                    .zip(items)
                    .map(|(ty, item)| coerce(ty, item))
                    .collect::<Result<_>>()?,
            ))
        }
        (DynSolType::Address, Value::String(s)) => s
            .parse::<Address>()
            .map(DynSolValue::Address)
            .with_context(|| format!("invalid address `{s}`")),
        (DynSolType::Bool, Value::Bool(flag)) => Ok(DynSolValue::Bool(*flag)),
        (DynSolType::Uint(bits), Value::Number(_) | Value::String(_)) => {
            let number = parse_uint(value)?;
            if number.bit_len() > *bits {
                bail!("{number} does not fit in uint{bits}");
            }
            Ok(DynSolValue::Uint(number, *bits))
        }
        (DynSolType::String, Value::String(s)) => Ok(DynSolValue::String(s.clone())),
        (DynSolType::Bytes, Value::String(s)) => hex::decode(s.trim_start_matches("0x"))
            .map(DynSolValue::Bytes)
            .with_context(|| format!("invalid hex `{s}`")),
        (_, Value::String(s)) => ty
            .coerce_str(s)
            .with_context(|| format!("`{s}` is not a valid {}", ty.sol_type_name())),
        (DynSolType::Int(_), Value::Number(n)) => ty
            .coerce_str(&n.to_string())
            .with_context(|| format!("{n} is not a valid {}", ty.sol_type_name())),
        (_, other) => bail!("cannot encode {other} as {}", ty.sol_type_name()),
    }
}

fn parse_uint(value: &Value) -> Result<U256> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(U256::from)
            .with_context(|| format!("expected an unsigned integer, got {n}")),
        Value::String(s) => {
            let s = s.trim().replace('_', "");
            let parsed = match s.strip_prefix("0x") {
                Some(hex) => U256::from_str_radix(hex, 16),
                None => U256::from_str_radix(&s, 10),
            };
            parsed.with_context(|| format!("invalid unsigned integer `{s}`"))
        }
        other => bail!("expected an unsigned integer, got {other}"),
    }
}

/// JSON form of a decoded value. Addresses are checksummed, integers that do not fit in a
/// `u64` become decimal strings and byte strings become `0x` hex.
pub fn to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Address(address) => json!(address.to_checksum(None)),
        DynSolValue::Bool(flag) => json!(flag),
        DynSolValue::Uint(number, _) => u64::try_from(*number)
            .map(Value::from)
            .unwrap_or_else(|_| json!(number.to_string())),
        DynSolValue::Int(number, _) => json!(number.to_string()),
        DynSolValue::FixedBytes(word, size) => {
            json!(format!("0x{}", hex::encode(&word[..*size])))
        }
        DynSolValue::Bytes(bytes) => json!(format!("0x{}", hex::encode(bytes))),
        DynSolValue::String(s) => json!(s),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(to_json).collect())
        }
        other => json!(format!("{other:?}")),
    }
}
