//! Mapping from quorum's element types to backend type tags, including
//! the custom half-precision type and its summation operator.
//!
//! Half precision is not backend-native: the first f16 use registers a
//! 2-byte custom type descriptor and a custom sum kernel with the
//! backend, and every f16 reduction routes through that operator
//! instead of the builtin sum. Registration happens once per mapper;
//! repeated calls reuse the cached tags.

use std::sync::{Arc, OnceLock};

use super::{BackendError, GroupComm, OpTag, TypeTag};
use crate::error::{QuorumError, Result};
use crate::types::DataType;

pub struct TypeMapper {
    backend: Arc<dyn GroupComm>,
    f16: OnceLock<(TypeTag, OpTag)>,
}

impl TypeMapper {
    pub fn new(backend: Arc<dyn GroupComm>) -> Self {
        Self {
            backend,
            f16: OnceLock::new(),
        }
    }

    /// Backend tag for `dtype`. Total for all production kinds; the
    /// `Null` sentinel is a caller contract violation and fails fast.
    pub fn to_backend_type(&self, dtype: DataType) -> Result<TypeTag> {
        match dtype {
            DataType::U8 => Ok(TypeTag::U8),
            DataType::I8 => Ok(TypeTag::I8),
            DataType::U16 => Ok(TypeTag::U16),
            DataType::I16 => Ok(TypeTag::I16),
            DataType::I32 => Ok(TypeTag::I32),
            DataType::I64 => Ok(TypeTag::I64),
            DataType::F32 => Ok(TypeTag::F32),
            DataType::F64 => Ok(TypeTag::F64),
            DataType::Bool => Ok(TypeTag::BOOL),
            DataType::Byte => Ok(TypeTag::BYTE),
            DataType::F16 => self.ensure_f16().map(|(ty, _)| ty),
            DataType::Null => Err(QuorumError::UnsupportedDType {
                dtype,
                op: "type_map",
            }),
        }
    }

    /// Summation operator for `dtype`: the builtin sum for every native
    /// kind, the registered custom operator for f16.
    pub fn sum_op(&self, dtype: DataType) -> Result<OpTag> {
        match dtype {
            DataType::F16 => self.ensure_f16().map(|(_, op)| op),
            DataType::Null => Err(QuorumError::UnsupportedDType {
                dtype,
                op: "sum_op",
            }),
            _ => Ok(OpTag::SUM),
        }
    }

    /// Element size in bytes via backend introspection.
    pub fn type_size(&self, dtype: DataType) -> Result<usize> {
        let tag = self.to_backend_type(dtype)?;
        self.backend
            .type_size_of(tag)
            .map_err(|e| QuorumError::CollectiveFailed {
                operation: "type_size",
                reason: e.to_string(),
            })
    }

    fn ensure_f16(&self) -> Result<(TypeTag, OpTag)> {
        if let Some(&pair) = self.f16.get() {
            return Ok(pair);
        }
        let wrap = |e: BackendError| QuorumError::CollectiveFailed {
            operation: "register_f16",
            reason: e.to_string(),
        };
        let ty = self.backend.register_custom_type(2).map_err(wrap)?;
        let op = self.backend.register_custom_op(f16_sum).map_err(wrap)?;
        // A concurrent first use may have won the race; keep whichever
        // pair landed so the mapping stays stable.
        let _ = self.f16.set((ty, op));
        Ok(*self.f16.get().unwrap_or(&(ty, op)))
    }
}

/// Elementwise f16 sum on little-endian byte slices.
///
/// Associative and commutative up to f16 rounding, which is what the
/// backend requires of a registered reduction operator.
pub(crate) fn f16_sum(acc: &mut [u8], src: &[u8]) {
    for (a, s) in acc.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
        let x = f16_to_f32(u16::from_le_bytes([a[0], a[1]]));
        let y = f16_to_f32(u16::from_le_bytes([s[0], s[1]]));
        a.copy_from_slice(&f32_to_f16(x + y).to_le_bytes());
    }
}

/// Widen IEEE 754 binary16 bits to f32.
pub(crate) fn f16_to_f32(h: u16) -> f32 {
    let sign = ((h & 0x8000) as u32) << 16;
    let exp = ((h >> 10) & 0x1F) as u32;
    let man = (h & 0x03FF) as u32;
    match exp {
        0 => {
            if man == 0 {
                f32::from_bits(sign)
            } else {
                // Subnormal: value is man * 2^-24, exactly representable.
                let mag = man as f32 * f32::from_bits(0x3380_0000);
                if sign != 0 { -mag } else { mag }
            }
        }
        0x1F => f32::from_bits(sign | 0x7F80_0000 | (man << 13)),
        _ => f32::from_bits(sign | ((exp + 112) << 23) | (man << 13)),
    }
}

/// Narrow f32 to IEEE 754 binary16 bits, rounding to nearest even.
pub(crate) fn f32_to_f16(v: f32) -> u16 {
    let bits = v.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xFF) as i32;
    let man = bits & 0x007F_FFFF;

    if exp == 0xFF {
        // Inf / NaN; keep NaN payloads quiet.
        let payload = if man != 0 { 0x0200 } else { 0 };
        return sign | 0x7C00 | payload;
    }

    let unbiased = exp - 127;
    if unbiased > 15 {
        return sign | 0x7C00; // overflow to inf
    }
    if unbiased >= -14 {
        let mut h = (((unbiased + 15) as u32) << 10) | (man >> 13);
        let rem = man & 0x1FFF;
        if rem > 0x1000 || (rem == 0x1000 && h & 1 != 0) {
            h += 1; // may carry into the exponent, which is correct RNE
        }
        return sign | h as u16;
    }
    if unbiased < -25 {
        return sign; // below half the smallest subnormal
    }

    // Subnormal half: shift the full 24-bit significand into place.
    let full = man | 0x0080_0000;
    let shift = (-unbiased - 1) as u32;
    let mut h = full >> shift;
    let rem = full & ((1 << shift) - 1);
    let halfway = 1u32 << (shift - 1);
    if rem > halfway || (rem == halfway && h & 1 != 0) {
        h += 1;
    }
    sign | h as u16
}
