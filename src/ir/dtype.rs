//! Element types, quantization parameters and element codecs.

use half::f16;
use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, ForgeResult};

/// Element data type of an operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Float32,
    Float16,
    Int32,
    Int64,
    UInt8,
    Bool8,
    /// Asymmetric 8-bit quantized, unsigned storage
    QuantUInt8Asymm,
    /// Symmetric 8-bit quantized, signed storage
    QuantInt8Symm,
}

impl DataType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DataType::Float32 | DataType::Int32 => 4,
            DataType::Int64 => 8,
            DataType::Float16 => 2,
            DataType::UInt8 | DataType::Bool8 | DataType::QuantUInt8Asymm | DataType::QuantInt8Symm => 1,
        }
    }

    pub fn is_quantized(self) -> bool {
        matches!(self, DataType::QuantUInt8Asymm | DataType::QuantInt8Symm)
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float16)
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::Float32 => "float32",
            DataType::Float16 => "float16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::UInt8 => "uint8",
            DataType::Bool8 => "bool8",
            DataType::QuantUInt8Asymm => "quant_uint8_asymm",
            DataType::QuantInt8Symm => "quant_int8_symm",
        }
    }
}

/// Quantization parameters
///
/// Per-tensor quantization has exactly one scale/zero-point pair and no
/// channel axis. Per-channel quantization carries one pair per slice along
/// `channel_axis` (a logical axis).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantization {
    pub scales: Vec<f32>,
    pub zero_points: Vec<i32>,
    pub channel_axis: Option<usize>,
}

impl Quantization {
    pub fn per_tensor(scale: f32, zero_point: i32) -> Self {
        Self {
            scales: vec![scale],
            zero_points: vec![zero_point],
            channel_axis: None,
        }
    }

    pub fn per_channel(scales: Vec<f32>, zero_points: Vec<i32>, channel_axis: usize) -> Self {
        Self {
            scales,
            zero_points,
            channel_axis: Some(channel_axis),
        }
    }

    pub fn is_per_channel(&self) -> bool {
        self.channel_axis.is_some()
    }

    /// Scale of channel `c` (or the tensor scale)
    pub fn scale(&self, c: usize) -> f32 {
        self.scales.get(c).or(self.scales.first()).copied().unwrap_or(1.0)
    }

    pub fn zero_point(&self, c: usize) -> i32 {
        self.zero_points
            .get(c)
            .or(self.zero_points.first())
            .copied()
            .unwrap_or(0)
    }
}

/// Element type plus optional quantization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub dtype: DataType,
    pub quant: Option<Quantization>,
}

impl TypeInfo {
    pub fn new(dtype: DataType) -> Self {
        Self { dtype, quant: None }
    }

    pub fn quantized(dtype: DataType, quant: Quantization) -> Self {
        Self {
            dtype,
            quant: Some(quant),
        }
    }

    pub fn element_size(&self) -> usize {
        self.dtype.size_in_bytes()
    }

    fn quant_params(&self, channel: usize) -> (f32, i32) {
        match &self.quant {
            Some(q) => (q.scale(channel), q.zero_point(channel)),
            None => (1.0, 0),
        }
    }

    /// Decode raw elements to f32.
    ///
    /// `channel_of` maps an element position in `bytes` to its quantization
    /// channel; it is only consulted for per-channel quantized types.
    pub fn decode_f32(
        &self,
        bytes: &[u8],
        channel_of: impl Fn(usize) -> usize,
    ) -> ForgeResult<Vec<f32>> {
        let size = self.element_size();
        if bytes.len() % size != 0 {
            return Err(ForgeError::InvariantViolation(format!(
                "{} buffer of {} bytes is not a whole number of elements",
                self.dtype.name(),
                bytes.len()
            )));
        }
        let per_channel = self.quant.as_ref().map_or(false, Quantization::is_per_channel);
        let values = bytes
            .chunks_exact(size)
            .enumerate()
            .map(|(i, raw)| {
                let channel = if per_channel { channel_of(i) } else { 0 };
                match self.dtype {
                    DataType::Float32 => f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
                    DataType::Float16 => f16::from_le_bytes([raw[0], raw[1]]).to_f32(),
                    DataType::Int32 => i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as f32,
                    DataType::Int64 => {
                        let mut b = [0u8; 8];
                        b.copy_from_slice(raw);
                        i64::from_le_bytes(b) as f32
                    }
                    DataType::UInt8 => raw[0] as f32,
                    DataType::Bool8 => {
                        if raw[0] != 0 {
                            1.0
                        } else {
                            0.0
                        }
                    }
                    DataType::QuantUInt8Asymm => {
                        let (scale, zp) = self.quant_params(channel);
                        (raw[0] as i32 - zp) as f32 * scale
                    }
                    DataType::QuantInt8Symm => {
                        let (scale, zp) = self.quant_params(channel);
                        (raw[0] as i8 as i32 - zp) as f32 * scale
                    }
                }
            })
            .collect();
        Ok(values)
    }

    /// Encode f32 values into this type, saturating integer conversions.
    pub fn encode_f32(&self, values: &[f32], channel_of: impl Fn(usize) -> usize) -> Vec<u8> {
        let per_channel = self.quant.as_ref().map_or(false, Quantization::is_per_channel);
        let mut out = Vec::with_capacity(values.len() * self.element_size());
        for (i, &v) in values.iter().enumerate() {
            let channel = if per_channel { channel_of(i) } else { 0 };
            match self.dtype {
                DataType::Float32 => out.extend_from_slice(&v.to_le_bytes()),
                DataType::Float16 => out.extend_from_slice(&f16::from_f32(v).to_le_bytes()),
                DataType::Int32 => out.extend_from_slice(&(v as i32).to_le_bytes()),
                DataType::Int64 => out.extend_from_slice(&(v as i64).to_le_bytes()),
                DataType::UInt8 => out.push(v.clamp(0.0, 255.0) as u8),
                DataType::Bool8 => out.push(u8::from(v != 0.0)),
                DataType::QuantUInt8Asymm => {
                    let (scale, zp) = self.quant_params(channel);
                    let q = (v / scale).round() as i32 + zp;
                    out.push(q.clamp(0, 255) as u8);
                }
                DataType::QuantInt8Symm => {
                    let (scale, zp) = self.quant_params(channel);
                    let q = (v / scale).round() as i32 + zp;
                    out.push(q.clamp(-128, 127) as i8 as u8);
                }
            }
        }
        out
    }

    /// Byte pattern of a logical zero (the zero point for quantized types)
    pub fn zero_element(&self) -> Vec<u8> {
        self.encode_f32(&[0.0], |_| 0)
    }
}

/// Little-endian i32 view of a constant buffer
pub fn bytes_to_i32(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

pub fn i32_to_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn f32_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
