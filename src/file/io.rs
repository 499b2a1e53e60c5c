//! Bounds-checked little-endian reading and writing of primitive values.
//!
//! Module images are little-endian throughout. Every helper here validates the requested
//! range before touching the buffer and reports [`crate::Error::OutOfBounds`] instead of
//! panicking, so a truncated image surfaces as a recoverable error.
//!
//! # Key Components
//!
//! - [`crate::file::io::CilIO`] - Conversion between primitives and their byte representation
//! - [`crate::file::io::read_le_at`] - Reading with auto-advance
//! - [`crate::file::io::write_le_at`] - In-place writing with auto-advance, used for IL token patches
//!
//! # Examples
//!
//! ```rust
//! use dotmod::file::io::{read_le_at, write_le_at};
//!
//! let mut data = [0u8; 6];
//! let mut offset = 0;
//! write_le_at::<u16>(&mut data, &mut offset, 0x0102)?;
//! write_le_at::<u32>(&mut data, &mut offset, 0x0A00_0001)?;
//!
//! let mut offset = 2;
//! assert_eq!(read_le_at::<u32>(&data, &mut offset)?, 0x0A00_0001);
//! # Ok::<(), dotmod::Error>(())
//! ```

use crate::Result;

/// Trait for primitive values that can be converted from and to little-endian bytes.
///
/// # Thread Safety
///
/// Implementations are pure conversions on primitive types.
pub trait CilIO: Sized {
    /// Fixed-size byte array representation of the type.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Read T from a byte buffer in little-endian
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Write T to a byte buffer in little-endian
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_cilio {
    ($($ty:ty),*) => {
        $(
            impl CilIO for $ty {
                type Bytes = [u8; std::mem::size_of::<$ty>()];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_cilio!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Reads a value of type `T` at `offset` and advances the offset past it.
///
/// # Arguments
/// * `data` - The buffer to read from
/// * `offset` - Read position, advanced by `size_of::<T>()` on success
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the read would pass the end of `data`.
pub fn read_le_at<T: CilIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(out_of_bounds_error!());
    };
    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(out_of_bounds_error!());
    };

    *offset = end;
    Ok(T::from_le_bytes(read))
}

/// Writes `value` at `offset` and advances the offset past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the write would pass the end of `data`.
pub fn write_le_at<T: CilIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(out_of_bounds_error!());
    };
    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    data[*offset..end].copy_from_slice(value.to_le_bytes().as_ref());
    *offset = end;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_read_le_at_advances() {
        let data = [0xFF, 0x34, 0x12];
        let mut offset = 1;
        assert_eq!(read_le_at::<u16>(&data, &mut offset).unwrap(), 0x1234);
        assert_eq!(offset, 3);
    }

    #[test]
    fn test_read_out_of_bounds() {
        let data = [0x01, 0x02];
        let mut offset = 1;
        assert!(matches!(
            read_le_at::<u32>(&data, &mut offset),
            Err(Error::OutOfBounds { .. })
        ));
        assert_eq!(offset, 1);

        let mut offset = usize::MAX;
        assert!(read_le_at::<u8>(&data, &mut offset).is_err());
    }

    #[test]
    fn test_write_le_at() {
        let mut data = [0u8; 5];
        let mut offset = 1;
        write_le_at::<u32>(&mut data, &mut offset, 0x0A00_0002).unwrap();
        assert_eq!(data, [0x00, 0x02, 0x00, 0x00, 0x0A]);
        assert_eq!(offset, 5);

        assert!(write_le_at::<u8>(&mut data, &mut offset, 1).is_err());
    }

    #[test]
    fn test_float_roundtrip_bits() {
        let mut data = [0u8; 8];
        let mut offset = 0;
        write_le_at::<f64>(&mut data, &mut offset, 1.5).unwrap();
        let mut offset = 0;
        assert_eq!(read_le_at::<f64>(&data, &mut offset).unwrap(), 1.5);
    }
}
