use std::fmt;
use std::str::FromStr;

use anyhow::{bail, ensure, Context, Result};
use bytes::Bytes;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    #[default]
    Cpu,
    Cuda {
        device_id: u32,
    },
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        if raw.eq_ignore_ascii_case("cpu") {
            return Ok(Device::Cpu);
        }

        if let Some(rest) = raw.strip_prefix("cuda:") {
            let device_id: u32 = rest.parse().context("invalid cuda device id")?;
            return Ok(Device::Cuda { device_id });
        }

        bail!("unsupported device: {raw} (expected cpu or cuda:N)");
    }
}

impl TryFrom<String> for Device {
    type Error = anyhow::Error;

    fn try_from(raw: String) -> Result<Self> {
        raw.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda { device_id } => write!(f, "cuda:{device_id}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    I64,
    I32,
    U8,
}

impl DType {
    pub fn byte_size(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::I64 => 8,
            DType::I32 => 4,
            DType::U8 => 1,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::I64 => "i64",
            DType::I32 => "i32",
            DType::U8 => "u8",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }
    pub fn dims(&self) -> &[usize] {
        &self.0
    }
    pub fn rank(&self) -> usize {
        self.0.len()
    }
    /// Element count; a rank-0 shape holds one element.
    pub fn numel(&self) -> usize {
        self.0.iter().product::<usize>()
    }
    /// The same shape with a new leading dimension of size `n`.
    pub fn prepend(&self, n: usize) -> Self {
        let mut dims = SmallVec::with_capacity(self.0.len() + 1);
        dims.push(n);
        dims.extend_from_slice(&self.0);
        Self(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0.as_slice())
    }
}

/// Host element types a [`Tensor`] can be built from or read back into.
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;

    fn extend_le(values: &[Self], out: &mut Vec<u8>);
    fn from_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn extend_le(values: &[Self], out: &mut Vec<u8>) {
                for v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }

            fn from_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(bytes);
                <$ty>::from_le_bytes(buf)
            }
        }
    };
}

impl_element!(f32, DType::F32);
impl_element!(i64, DType::I64);
impl_element!(i32, DType::I32);
impl_element!(u8, DType::U8);

/// Dense host tensor, little-endian, row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub dtype: DType,
    pub shape: Shape,
    pub data: Bytes,
}

impl Tensor {
    pub fn from_bytes(dtype: DType, shape: Shape, data: Bytes) -> Result<Self> {
        let expected = shape.numel() * dtype.byte_size();
        ensure!(
            data.len() == expected,
            "tensor byte size mismatch: got {}, expected {} for {dtype}{shape}",
            data.len(),
            expected
        );
        Ok(Self { dtype, shape, data })
    }

    pub fn from_vec<T: Element>(dims: &[usize], values: &[T]) -> Result<Self> {
        let shape = Shape::from_slice(dims);
        ensure!(
            values.len() == shape.numel(),
            "{} values do not fill shape {shape}",
            values.len()
        );
        let mut out = Vec::with_capacity(values.len() * T::DTYPE.byte_size());
        T::extend_le(values, &mut out);
        Ok(Self {
            dtype: T::DTYPE,
            shape,
            data: Bytes::from(out),
        })
    }

    pub fn scalar<T: Element>(value: T) -> Self {
        let mut out = Vec::with_capacity(T::DTYPE.byte_size());
        T::extend_le(&[value], &mut out);
        Self {
            dtype: T::DTYPE,
            shape: Shape::default(),
            data: Bytes::from(out),
        }
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        ensure!(
            self.dtype == T::DTYPE,
            "cannot read {} tensor as {}",
            self.dtype,
            T::DTYPE
        );
        Ok(self
            .data
            .chunks_exact(T::DTYPE.byte_size())
            .map(T::from_le)
            .collect())
    }

    /// Adds a leading batch dimension of size one. The data is unchanged.
    pub fn expand_dims0(self) -> Self {
        Self {
            shape: self.shape.prepend(1),
            ..self
        }
    }

    pub fn to_array(&self) -> Result<Array> {
        let dims = IxDyn(self.shape.dims());
        let array = match self.dtype {
            DType::F32 => Array::F32(ArrayD::from_shape_vec(dims, self.to_vec::<f32>()?)?),
            DType::I64 => Array::I64(ArrayD::from_shape_vec(dims, self.to_vec::<i64>()?)?),
            DType::I32 => Array::I32(ArrayD::from_shape_vec(dims, self.to_vec::<i32>()?)?),
            DType::U8 => Array::U8(ArrayD::from_shape_vec(dims, self.data.to_vec())?),
        };
        Ok(array)
    }
}

/// Plain numeric array handed back to callers once a runtime is done with a tensor.
#[derive(Clone, Debug, PartialEq)]
pub enum Array {
    F32(ArrayD<f32>),
    I64(ArrayD<i64>),
    I32(ArrayD<i32>),
    U8(ArrayD<u8>),
}

impl Array {
    pub fn dtype(&self) -> DType {
        match self {
            Array::F32(_) => DType::F32,
            Array::I64(_) => DType::I64,
            Array::I32(_) => DType::I32,
            Array::U8(_) => DType::U8,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Array::F32(a) => a.shape(),
            Array::I64(a) => a.shape(),
            Array::I32(a) => a.shape(),
            Array::U8(a) => a.shape(),
        }
    }

    pub fn as_f32(&self) -> Option<&ArrayD<f32>> {
        match self {
            Array::F32(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<&ArrayD<i64>> {
        match self {
            Array::I64(a) => Some(a),
            _ => None,
        }
    }

    /// Reads a single-element integer array, as produced for step counters.
    pub fn scalar_i64(&self) -> Option<i64> {
        match self {
            Array::I64(a) if a.len() == 1 => a.iter().next().copied(),
            Array::I32(a) if a.len() == 1 => a.iter().next().map(|v| i64::from(*v)),
            _ => None,
        }
    }
}
