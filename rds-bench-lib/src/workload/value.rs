use rand::Rng;

use crate::config::{ValueClass, ValueSpec};

/// Appends `items` values shaped by `spec` to `buf`, each exactly
/// `spec.length` bytes long.
///
/// Integer values are little-endian and never exceed the range a
/// `spec.length` wide unsigned integer can hold.
pub fn fill_values<R: Rng + ?Sized>(spec: &ValueSpec, items: u32, rng: &mut R, buf: &mut Vec<u8>) {
    for _ in 0..items {
        let start = buf.len();
        buf.resize(start + spec.length, 0);
        let value = &mut buf[start..];
        match spec.class {
            ValueClass::Bytes => rng.fill(value),
            ValueClass::Integer => {
                let n: u64 = rng.random();
                value.copy_from_slice(&n.to_le_bytes()[..spec.length]);
            }
        }
    }
}

/// Reads back an integer value produced by [`fill_values`].
pub fn decode_integer(value: &[u8]) -> Option<u64> {
    if value.is_empty() || value.len() > 8 {
        return None;
    }
    let mut bytes = [0u8; 8];
    bytes[..value.len()].copy_from_slice(value);
    Some(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng as _, rngs::SmallRng};

    use super::*;

    #[test]
    fn integer_values_are_fixed_width() {
        let spec = ValueSpec {
            length: 8,
            class: ValueClass::Integer,
        };
        let mut rng = SmallRng::seed_from_u64(9);

        let mut buf = Vec::new();
        fill_values(&spec, 1_000, &mut rng, &mut buf);
        assert_eq!(buf.len(), 8_000);
        for value in buf.chunks(8) {
            assert_eq!(value.len(), 8);
            assert!(decode_integer(value).is_some());
        }
    }

    #[test]
    fn narrow_integers_fit_their_width() {
        let spec = ValueSpec {
            length: 2,
            class: ValueClass::Integer,
        };
        let mut rng = SmallRng::seed_from_u64(10);

        let mut buf = Vec::new();
        fill_values(&spec, 100, &mut rng, &mut buf);
        for value in buf.chunks(2) {
            assert!(decode_integer(value).unwrap() <= u16::MAX as u64);
        }
    }

    #[test]
    fn byte_values_append_and_are_reproducible() {
        let spec = ValueSpec {
            length: 5,
            class: ValueClass::Bytes,
        };

        let mut a = b"key".to_vec();
        fill_values(&spec, 3, &mut SmallRng::seed_from_u64(11), &mut a);
        assert_eq!(a.len(), 3 + 15);
        assert_eq!(&a[..3], b"key");

        let mut b = b"key".to_vec();
        fill_values(&spec, 3, &mut SmallRng::seed_from_u64(11), &mut b);
        assert_eq!(a, b);
    }
}
