//! Floating-point logic unit: IEEE-754 `f32` arithmetic (spec.md §4.3).

use crate::error::{EmuError, EmuResult};

fn to_f32(bytes: &[u8]) -> EmuResult<f32> {
    let arr: [u8; 4] = bytes.try_into().map_err(|_| EmuError::SizeMismatch)?;
    Ok(f32::from_le_bytes(arr))
}

fn from_f32(v: f32) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

pub struct Fpu;

impl Fpu {
    pub fn add(a: &[u8], b: &[u8]) -> EmuResult<Vec<u8>> {
        Ok(from_f32(to_f32(a)? + to_f32(b)?))
    }

    pub fn sub(a: &[u8], b: &[u8]) -> EmuResult<Vec<u8>> {
        Ok(from_f32(to_f32(a)? - to_f32(b)?))
    }

    pub fn mul(a: &[u8], b: &[u8]) -> EmuResult<Vec<u8>> {
        Ok(from_f32(to_f32(a)? * to_f32(b)?))
    }

    pub fn div(a: &[u8], b: &[u8]) -> EmuResult<Vec<u8>> {
        let (a, b) = (to_f32(a)?, to_f32(b)?);
        if b == 0.0 {
            return Err(EmuError::DivideByZero);
        }
        Ok(from_f32(a / b))
    }

    pub fn power(a: &[u8], b: &[u8]) -> EmuResult<Vec<u8>> {
        Ok(from_f32(to_f32(a)?.powf(to_f32(b)?)))
    }

    /// Unsigned/signed ordering used by `CMPF`: returns `(lt, gt, eq)`.
    pub fn cmp(a: &[u8], b: &[u8]) -> EmuResult<(bool, bool, bool)> {
        let (a, b) = (to_f32(a)?, to_f32(b)?);
        Ok((a < b, a > b, a == b))
    }

    pub fn int_to_float(src: &[u8]) -> EmuResult<Vec<u8>> {
        let mut buf = [0u8; 8];
        buf[..src.len()].copy_from_slice(src);
        Ok(from_f32(u64::from_le_bytes(buf) as f32))
    }

    pub fn signed_int_to_float(src: &[u8]) -> EmuResult<Vec<u8>> {
        let mut buf = [0u8; 8];
        buf[..src.len()].copy_from_slice(src);
        if let Some(&top) = src.last() {
            if top & 0x80 != 0 {
                buf[src.len()..].fill(0xFF);
            }
        }
        Ok(from_f32(i64::from_le_bytes(buf) as f32))
    }

    pub fn float_to_int(src: &[u8], width: usize) -> EmuResult<Vec<u8>> {
        let value = to_f32(src)?;
        if !value.is_finite() || value < 0.0 {
            return Err(EmuError::OverflowCarry);
        }
        Ok((value as u64).to_le_bytes()[..width].to_vec())
    }

    pub fn float_to_signed_int(src: &[u8], width: usize) -> EmuResult<Vec<u8>> {
        let value = to_f32(src)?;
        if !value.is_finite() {
            return Err(EmuError::OverflowSigned);
        }
        Ok((value as i64).to_le_bytes()[..width].to_vec())
    }
}
