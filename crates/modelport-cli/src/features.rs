//! JSON encoding of feature and prediction tensors for the command line.
//!
//! Both directions use one object per tensor:
//! `{"x": {"dtype": "f32", "shape": [3], "data": [1.0, 2.0, 3.0]}}`,
//! with `data` flattened in row-major order. Non-finite `f32` values are
//! written as the strings `"NaN"`, `"inf"` and `"-inf"`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use modelport_core::{Array, DType, Tensor, TensorMap};
use modelport_predictor::Predictions;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Deserialize)]
struct JsonTensor {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<Value>,
}

pub fn read_features(path: &Path) -> Result<TensorMap> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read features from {}", path.display()))?;
    parse_features(&raw).with_context(|| format!("invalid features file {}", path.display()))
}

pub fn parse_features(raw: &str) -> Result<TensorMap> {
    let tensors: BTreeMap<String, JsonTensor> = serde_json::from_str(raw)?;
    tensors
        .into_iter()
        .map(|(name, tensor)| {
            let decoded = decode(&tensor).with_context(|| format!("feature `{name}`"))?;
            Ok((name, decoded))
        })
        .collect()
}

fn decode(tensor: &JsonTensor) -> Result<Tensor> {
    let dims = &tensor.shape;
    match tensor.dtype {
        DType::F32 => {
            let values = elements(&tensor.data, decode_f32)?;
            Tensor::from_vec(dims, &values)
        }
        DType::I64 => {
            let values = elements(&tensor.data, |v| v.as_i64())?;
            Tensor::from_vec(dims, &values)
        }
        DType::I32 => {
            let values = elements(&tensor.data, |v| {
                v.as_i64().and_then(|v| i32::try_from(v).ok())
            })?;
            Tensor::from_vec(dims, &values)
        }
        DType::U8 => {
            let values = elements(&tensor.data, |v| {
                v.as_u64().and_then(|v| u8::try_from(v).ok())
            })?;
            Tensor::from_vec(dims, &values)
        }
    }
}

fn elements<T>(data: &[Value], convert: impl Fn(&Value) -> Option<T>) -> Result<Vec<T>> {
    data.iter()
        .enumerate()
        .map(|(i, value)| {
            convert(value).with_context(|| format!("element {i} ({value}) is not a valid value"))
        })
        .collect()
}

fn decode_f32(value: &Value) -> Option<f32> {
    match value {
        Value::Number(n) => n.as_f64().map(|v| v as f32),
        Value::String(s) => match s.as_str() {
            "NaN" => Some(f32::NAN),
            "inf" => Some(f32::INFINITY),
            "-inf" => Some(f32::NEG_INFINITY),
            _ => None,
        },
        _ => None,
    }
}

fn encode_f32(value: f32) -> Value {
    if value.is_nan() {
        Value::from("NaN")
    } else if value.is_infinite() {
        Value::from(if value > 0.0 { "inf" } else { "-inf" })
    } else {
        Value::from(f64::from(value))
    }
}

pub fn predictions_to_json(predictions: &Predictions) -> Result<Value> {
    let encoded: BTreeMap<&str, JsonTensor> = predictions
        .iter()
        .map(|(name, array)| (name.as_str(), encode(array)))
        .collect();
    Ok(serde_json::to_value(encoded)?)
}

fn encode(array: &Array) -> JsonTensor {
    let data = match array {
        Array::F32(a) => a.iter().map(|v| encode_f32(*v)).collect(),
        Array::I64(a) => a.iter().map(|v| Value::from(*v)).collect(),
        Array::I32(a) => a.iter().map(|v| Value::from(*v)).collect(),
        Array::U8(a) => a.iter().map(|v| Value::from(*v)).collect(),
    };
    JsonTensor {
        dtype: array.dtype(),
        shape: array.shape().to_vec(),
        data,
    }
}
