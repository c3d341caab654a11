use std::fmt;

use crate::error::{Error, Result};

// DType - Element data types of logical blobs
//
// Every blob descriptor carries a DType. Across the boundary it travels as a
// stable numeric code (what GetDataType returns) or as its lowercase name in
// structured text:
//
//   F32 = 2   - 32-bit float, the default
//   F64 = 3   - 64-bit float
//   I8  = 4   - signed byte
//   I32 = 5   - signed 32-bit int
//   I64 = 6   - signed 64-bit int, labels and indices
//   U8  = 7   - unsigned byte, image data
//   F16 = 9   - 16-bit IEEE half float

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    F32,
    F64,
    I8,
    I32,
    I64,
    U8,
}

const ALL_DTYPES: [DType; 7] = [
    DType::F16,
    DType::F32,
    DType::F64,
    DType::I8,
    DType::I32,
    DType::I64,
    DType::U8,
];

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::I8 | DType::U8 => 1,
            DType::F16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::F32 | DType::F64)
    }

    /// Stable wire code.
    pub fn code(&self) -> i64 {
        match self {
            DType::F32 => 2,
            DType::F64 => 3,
            DType::I8 => 4,
            DType::I32 => 5,
            DType::I64 => 6,
            DType::U8 => 7,
            DType::F16 => 9,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        ALL_DTYPES
            .iter()
            .copied()
            .find(|d| d.code() == code)
            .ok_or_else(|| Error::schema("data_type", format!("unknown dtype code {code}")))
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I8 => "i8",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        ALL_DTYPES
            .iter()
            .copied()
            .find(|d| d.name() == name)
            .ok_or_else(|| Error::schema("data_type", format!("unknown dtype '{name}'")))
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// WithDType - Trait that connects Rust types to DType enum
//
// Host arrays are generic over their element type; this trait gives the
// runtime DType of a Rust element type so pushed data can be checked
// against a declared blob dtype.

/// Trait implemented by Rust types that can be fed into a blob.
pub trait WithDType: Copy + Send + Sync + 'static + num_traits::NumCast + fmt::Debug {
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    fn to_f64(self) -> f64;

    fn from_f64(v: f64) -> Self;

    fn zero() -> Self {
        Self::from_f64(0.0)
    }
}

macro_rules! with_dtype_cast {
    ($ty:ty, $dt:expr) => {
        impl WithDType for $ty {
            const DTYPE: DType = $dt;
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(v: f64) -> Self {
                v as $ty
            }
        }
    };
}

with_dtype_cast!(f32, DType::F32);
with_dtype_cast!(f64, DType::F64);
with_dtype_cast!(i8, DType::I8);
with_dtype_cast!(i32, DType::I32);
with_dtype_cast!(i64, DType::I64);
with_dtype_cast!(u8, DType::U8);

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size() {
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::I64.size_in_bytes(), 8);
        assert_eq!(DType::U8.size_in_bytes(), 1);
    }

    #[test]
    fn test_codes_and_names_are_stable() {
        assert_eq!(DType::F32.code(), 2);
        assert_eq!(DType::F16.code(), 9);
        for d in ALL_DTYPES {
            assert_eq!(DType::from_code(d.code()).unwrap(), d);
            assert_eq!(DType::from_name(d.name()).unwrap(), d);
        }
        assert!(DType::from_code(1).is_err());
        assert!(DType::from_name("bf16").is_err());
    }

    #[test]
    fn test_with_dtype() {
        assert_eq!(f32::DTYPE, DType::F32);
        assert_eq!(half::f16::DTYPE, DType::F16);
        assert_eq!(i32::from_f64(42.0).to_f64(), 42.0);
        assert_eq!(u8::zero(), 0);
    }
}
