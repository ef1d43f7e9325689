//! Element types and reduction operators for collective calls

use std::fmt;
use std::str::FromStr;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::error::{ReduceError, Result};

/// Element data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[default]
    F32,
    F16,
    BF16,
    F64,
    I32,
}

impl DType {
    pub fn size_bytes(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::F64 => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F64 => "f64",
            DType::I32 => "i32",
        }
    }

    /// Collective-library data type
    #[cfg(feature = "cuda")]
    pub fn nccl_type(&self) -> cudarc::nccl::sys::ncclDataType_t {
        use cudarc::nccl::sys::ncclDataType_t;
        match self {
            DType::F32 => ncclDataType_t::ncclFloat32,
            DType::F16 => ncclDataType_t::ncclFloat16,
            DType::BF16 => ncclDataType_t::ncclBfloat16,
            DType::F64 => ncclDataType_t::ncclFloat64,
            DType::I32 => ncclDataType_t::ncclInt32,
        }
    }

    /// Decode one element to f64 (for reporting and host reduction)
    pub fn decode(&self, bytes: &[u8]) -> f64 {
        match self {
            DType::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
            DType::F16 => f16::from_bits(u16::from_le_bytes([bytes[0], bytes[1]])).to_f64(),
            DType::BF16 => bf16::from_bits(u16::from_le_bytes([bytes[0], bytes[1]])).to_f64(),
            DType::F64 => f64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
            DType::I32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        }
    }

    /// Encode one f64 value into `out` as this dtype
    pub fn encode(&self, value: f64, out: &mut [u8]) {
        match self {
            DType::F32 => out.copy_from_slice(&(value as f32).to_le_bytes()),
            DType::F16 => out.copy_from_slice(&f16::from_f64(value).to_bits().to_le_bytes()),
            DType::BF16 => out.copy_from_slice(&bf16::from_f64(value).to_bits().to_le_bytes()),
            DType::F64 => out.copy_from_slice(&value.to_le_bytes()),
            DType::I32 => out.copy_from_slice(&(value as i32).to_le_bytes()),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = ReduceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "f32" | "float" | "float32" => Ok(DType::F32),
            "f16" | "half" | "float16" => Ok(DType::F16),
            "bf16" | "bfloat16" => Ok(DType::BF16),
            "f64" | "double" | "float64" => Ok(DType::F64),
            "i32" | "int" | "int32" => Ok(DType::I32),
            _ => Err(ReduceError::InvalidConfig(format!("unknown dtype '{}'", s))),
        }
    }
}

/// Reduction operator applied element-wise across participants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReduceOp {
    #[default]
    Sum,
    Prod,
    Max,
    Min,
    Avg,
}

impl ReduceOp {
    pub fn name(&self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Prod => "prod",
            ReduceOp::Max => "max",
            ReduceOp::Min => "min",
            ReduceOp::Avg => "avg",
        }
    }

    #[cfg(feature = "cuda")]
    pub fn nccl_op(&self) -> cudarc::nccl::sys::ncclRedOp_t {
        use cudarc::nccl::sys::ncclRedOp_t;
        match self {
            ReduceOp::Sum => ncclRedOp_t::ncclSum,
            ReduceOp::Prod => ncclRedOp_t::ncclProd,
            ReduceOp::Max => ncclRedOp_t::ncclMax,
            ReduceOp::Min => ncclRedOp_t::ncclMin,
            ReduceOp::Avg => ncclRedOp_t::ncclAvg,
        }
    }

    /// Fold a sequence of participant values
    pub fn fold(&self, values: impl Iterator<Item = f64>) -> f64 {
        let mut n = 0usize;
        let mut acc: Option<f64> = None;
        for v in values {
            n += 1;
            acc = Some(match (acc, self) {
                (None, _) => v,
                (Some(a), ReduceOp::Sum | ReduceOp::Avg) => a + v,
                (Some(a), ReduceOp::Prod) => a * v,
                (Some(a), ReduceOp::Max) => a.max(v),
                (Some(a), ReduceOp::Min) => a.min(v),
            });
        }
        let acc = acc.unwrap_or(0.0);
        match self {
            ReduceOp::Avg if n > 0 => acc / n as f64,
            _ => acc,
        }
    }
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReduceOp {
    type Err = ReduceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sum" => Ok(ReduceOp::Sum),
            "prod" | "product" => Ok(ReduceOp::Prod),
            "max" => Ok(ReduceOp::Max),
            "min" => Ok(ReduceOp::Min),
            "avg" | "mean" => Ok(ReduceOp::Avg),
            _ => Err(ReduceError::InvalidConfig(format!("unknown reduce op '{}'", s))),
        }
    }
}

/// Reduce `inputs` element-wise into `out` (host fallback for the collective)
///
/// Every input and `out` must hold `count` elements of `dtype`. Integer sums wrap
/// like the device implementation does.
pub fn reduce_into(dtype: DType, op: ReduceOp, count: usize, inputs: &[Vec<u8>], out: &mut [u8]) -> Result<()> {
    let elem = dtype.size_bytes();
    let nbytes = count * elem;
    if out.len() < nbytes {
        return Err(ReduceError::Collective(format!(
            "output holds {} bytes, need {}",
            out.len(),
            nbytes
        )));
    }
    if let Some(short) = inputs.iter().position(|b| b.len() < nbytes) {
        return Err(ReduceError::Collective(format!(
            "input {} holds {} bytes, need {}",
            short,
            inputs[short].len(),
            nbytes
        )));
    }

    if dtype == DType::I32 {
        for i in 0..count {
            let range = i * elem..(i + 1) * elem;
            let vals = inputs.iter().map(|b| {
                let c = &b[range.clone()];
                i32::from_le_bytes([c[0], c[1], c[2], c[3]])
            });
            let r = reduce_i32(op, vals, inputs.len());
            out[range].copy_from_slice(&r.to_le_bytes());
        }
        return Ok(());
    }

    for i in 0..count {
        let range = i * elem..(i + 1) * elem;
        let r = op.fold(inputs.iter().map(|b| dtype.decode(&b[range.clone()])));
        dtype.encode(r, &mut out[range]);
    }
    Ok(())
}

fn reduce_i32(op: ReduceOp, mut vals: impl Iterator<Item = i32>, n: usize) -> i32 {
    let first = vals.next().unwrap_or(0);
    let acc = vals.fold(first, |a, v| match op {
        ReduceOp::Sum | ReduceOp::Avg => a.wrapping_add(v),
        ReduceOp::Prod => a.wrapping_mul(v),
        ReduceOp::Max => a.max(v),
        ReduceOp::Min => a.min(v),
    });
    match op {
        ReduceOp::Avg if n > 0 => acc / n as i32,
        _ => acc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(vals: &[f32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn f32_vals(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DType::F32.size_bytes(), 4);
        assert_eq!(DType::BF16.size_bytes(), 2);
        assert_eq!(DType::F64.size_bytes(), 8);
    }

    #[test]
    fn test_parse() {
        assert_eq!("float".parse::<DType>().unwrap(), DType::F32);
        assert_eq!("BF16".parse::<DType>().unwrap(), DType::BF16);
        assert_eq!("mean".parse::<ReduceOp>().unwrap(), ReduceOp::Avg);
        assert!("f8".parse::<DType>().is_err());
        assert!("xor".parse::<ReduceOp>().is_err());
    }

    #[test]
    fn test_reduce_f32_sum_and_max() {
        let inputs = vec![f32_bytes(&[1.0, 2.0, 3.0, 4.0]), f32_bytes(&[5.0, 6.0, 7.0, 8.0])];
        let mut out = vec![0u8; 16];

        reduce_into(DType::F32, ReduceOp::Sum, 4, &inputs, &mut out).unwrap();
        assert_eq!(f32_vals(&out), vec![6.0, 8.0, 10.0, 12.0]);

        reduce_into(DType::F32, ReduceOp::Max, 4, &inputs, &mut out).unwrap();
        assert_eq!(f32_vals(&out), vec![5.0, 6.0, 7.0, 8.0]);

        reduce_into(DType::F32, ReduceOp::Avg, 4, &inputs, &mut out).unwrap();
        assert_eq!(f32_vals(&out), vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_reduce_bf16_prod() {
        let enc = |v: f32| bf16::from_f32(v).to_bits().to_le_bytes();
        let inputs = vec![
            [enc(2.0), enc(-1.5)].concat(),
            [enc(4.0), enc(2.0)].concat(),
        ];
        let mut out = vec![0u8; 4];
        reduce_into(DType::BF16, ReduceOp::Prod, 2, &inputs, &mut out).unwrap();
        assert_eq!(DType::BF16.decode(&out[0..2]), 8.0);
        assert_eq!(DType::BF16.decode(&out[2..4]), -3.0);
    }

    #[test]
    fn test_reduce_i32_wraps() {
        let inputs = vec![i32::MAX.to_le_bytes().to_vec(), 1i32.to_le_bytes().to_vec()];
        let mut out = vec![0u8; 4];
        reduce_into(DType::I32, ReduceOp::Sum, 1, &inputs, &mut out).unwrap();
        assert_eq!(i32::from_le_bytes([out[0], out[1], out[2], out[3]]), i32::MIN);
    }

    #[test]
    fn test_reduce_rejects_short_input() {
        let inputs = vec![vec![0u8; 8], vec![0u8; 4]];
        let mut out = vec![0u8; 8];
        assert!(reduce_into(DType::F32, ReduceOp::Sum, 2, &inputs, &mut out).is_err());
    }
}
