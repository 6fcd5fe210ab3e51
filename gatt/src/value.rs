//! Conversions between characteristic values and Rust types.
//!
//! Integers use the little-endian byte order mandated for GATT characteristic values. Decoding
//! reads a prefix of the value and ignores trailing bytes, so a `u8` can be read from a
//! characteristic that carries flags after its first byte.

/// A type that can be decoded from a characteristic value.
pub trait FromValue: Sized {
    /// Decodes `value`, returning `None` if it is too short or malformed.
    fn from_value(value: &[u8]) -> Option<Self>;
}

/// A type that can be encoded as a characteristic value.
pub trait IntoValue {
    fn into_value(self) -> Vec<u8>;
}

impl FromValue for Vec<u8> {
    fn from_value(value: &[u8]) -> Option<Self> {
        Some(value.to_vec())
    }
}

impl IntoValue for Vec<u8> {
    fn into_value(self) -> Vec<u8> {
        self
    }
}

impl IntoValue for &[u8] {
    fn into_value(self) -> Vec<u8> {
        self.to_vec()
    }
}

impl FromValue for String {
    fn from_value(value: &[u8]) -> Option<Self> {
        String::from_utf8(value.to_vec()).ok()
    }
}

impl IntoValue for String {
    fn into_value(self) -> Vec<u8> {
        self.into_bytes()
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

macro_rules! impl_le_int {
    ($($ty:ty),*) => {$(
        impl FromValue for $ty {
            fn from_value(value: &[u8]) -> Option<Self> {
                let bytes = value.get(..size_of::<$ty>())?;
                Some(<$ty>::from_le_bytes(bytes.try_into().ok()?))
            }
        }

        impl IntoValue for $ty {
            fn into_value(self) -> Vec<u8> {
                self.to_le_bytes().to_vec()
            }
        }
    )*};
}

impl_le_int!(u8, u16, u32, i8, i16, i32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_little_endian() {
        assert_eq!(u16::from_value(&[0x34, 0x12]), Some(0x1234));
        assert_eq!(0x1234_5678u32.into_value(), vec![0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn short_values_do_not_decode() {
        assert_eq!(u32::from_value(&[0x01, 0x02]), None);
        assert_eq!(u8::from_value(&[]), None);
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        assert_eq!(u8::from_value(&[0x55, 0xff, 0xff]), Some(0x55));
    }

    #[test]
    fn strings_must_be_utf8() {
        assert_eq!(String::from_value(b"Polar H7"), Some("Polar H7".to_string()));
        assert_eq!(String::from_value(&[0xff, 0xfe]), None);
        assert_eq!("abc".into_value(), b"abc".to_vec());
    }
}
