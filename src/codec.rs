//! `BinaryCodec` — big-endian fixed-width integer / length-prefixed byte
//! packer (spec §4.1). Used by the canonical context encoder and by the
//! key-sequence cipher to frame `seq ‖ ciphertext` and its serialized
//! key/counter arrays.

use crate::error::{CoreError, CoreResult};

/// One slot in a pack/unpack pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Atom {
    U8,
    U16,
    U32,
    U64,
    /// Raw bytes with no length prefix. May appear at most once in a
    /// pattern and must be last; on `load` it absorbs the remainder.
    Bytes,
}

/// One decoded/encoded slot value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Bytes(Vec<u8>),
}

impl Field {
    pub fn as_u32(&self) -> CoreResult<u32> {
        match self {
            Field::U32(v) => Ok(*v),
            _ => Err(CoreError::Corrupt("expected u32 field".into())),
        }
    }

    pub fn as_u64(&self) -> CoreResult<u64> {
        match self {
            Field::U64(v) => Ok(*v),
            _ => Err(CoreError::Corrupt("expected u64 field".into())),
        }
    }

    pub fn into_bytes(self) -> CoreResult<Vec<u8>> {
        match self {
            Field::Bytes(b) => Ok(b),
            _ => Err(CoreError::Corrupt("expected bytes field".into())),
        }
    }
}

fn fixed_width(atom: Atom) -> Option<usize> {
    match atom {
        Atom::U8 => Some(1),
        Atom::U16 => Some(2),
        Atom::U32 => Some(4),
        Atom::U64 => Some(8),
        Atom::Bytes => None,
    }
}

/// Validate that `Bytes` occurs at most once, and only in the last slot.
fn validate_pattern(pattern: &[Atom]) -> CoreResult<()> {
    if let Some(pos) = pattern.iter().position(|a| *a == Atom::Bytes) {
        if pos != pattern.len() - 1 {
            return Err(CoreError::Corrupt(
                "bytes atom must be last in pattern".into(),
            ));
        }
    }
    Ok(())
}

pub fn dump(pattern: &[Atom], values: &[Field]) -> CoreResult<Vec<u8>> {
    validate_pattern(pattern)?;
    if pattern.len() != values.len() {
        return Err(CoreError::Corrupt(
            "pattern/value length mismatch in dump".into(),
        ));
    }
    let mut out = Vec::new();
    for (atom, value) in pattern.iter().zip(values) {
        match (atom, value) {
            (Atom::U8, Field::U8(v)) => out.push(*v),
            (Atom::U16, Field::U16(v)) => out.extend_from_slice(&v.to_be_bytes()),
            (Atom::U32, Field::U32(v)) => out.extend_from_slice(&v.to_be_bytes()),
            (Atom::U64, Field::U64(v)) => out.extend_from_slice(&v.to_be_bytes()),
            (Atom::Bytes, Field::Bytes(b)) => out.extend_from_slice(b),
            _ => return Err(CoreError::Corrupt("pattern/value type mismatch".into())),
        }
    }
    Ok(out)
}

pub fn load(pattern: &[Atom], bytes: &[u8]) -> CoreResult<Vec<Field>> {
    validate_pattern(pattern)?;
    let mut cursor = 0usize;
    let mut out = Vec::with_capacity(pattern.len());
    for (i, atom) in pattern.iter().enumerate() {
        match fixed_width(*atom) {
            Some(width) => {
                if bytes.len() < cursor + width {
                    return Err(CoreError::Corrupt("buffer too short".into()));
                }
                let slice = &bytes[cursor..cursor + width];
                let field = match atom {
                    Atom::U8 => Field::U8(slice[0]),
                    Atom::U16 => Field::U16(u16::from_be_bytes(slice.try_into().unwrap())),
                    Atom::U32 => Field::U32(u32::from_be_bytes(slice.try_into().unwrap())),
                    Atom::U64 => Field::U64(u64::from_be_bytes(slice.try_into().unwrap())),
                    Atom::Bytes => unreachable!(),
                };
                out.push(field);
                cursor += width;
            }
            None => {
                debug_assert_eq!(i, pattern.len() - 1);
                out.push(Field::Bytes(bytes[cursor..].to_vec()));
                cursor = bytes.len();
            }
        }
    }
    if cursor != bytes.len() {
        return Err(CoreError::Corrupt("trailing unused bytes".into()));
    }
    Ok(out)
}

/// A type that can be packed/unpacked as a fixed-width big-endian atom,
/// used by `dump_array` / `load_array`.
pub trait FixedWidth: Copy {
    const WIDTH: usize;
    fn to_be(self) -> Vec<u8>;
    fn from_be(bytes: &[u8]) -> Self;
}

impl FixedWidth for u32 {
    const WIDTH: usize = 4;
    fn to_be(self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }
    fn from_be(bytes: &[u8]) -> Self {
        u32::from_be_bytes(bytes.try_into().unwrap())
    }
}

impl FixedWidth for u64 {
    const WIDTH: usize = 8;
    fn to_be(self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }
    fn from_be(bytes: &[u8]) -> Self {
        u64::from_be_bytes(bytes.try_into().unwrap())
    }
}

pub fn dump_array<T: FixedWidth>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::WIDTH);
    for v in values {
        out.extend_from_slice(&v.to_be());
    }
    out
}

pub fn load_array<T: FixedWidth>(bytes: &[u8]) -> CoreResult<Vec<T>> {
    if bytes.len() % T::WIDTH != 0 {
        return Err(CoreError::Corrupt("array length not a multiple of width".into()));
    }
    Ok(bytes.chunks(T::WIDTH).map(T::from_be).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_mixed_pattern() {
        let pattern = [Atom::U32, Atom::Bytes];
        let values = vec![Field::U32(7), Field::Bytes(vec![1, 2, 3])];
        let bytes = dump(&pattern, &values).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 7, 1, 2, 3]);
        let loaded = load(&pattern, &bytes).unwrap();
        assert_eq!(loaded, values);
    }

    #[test]
    fn rejects_trailing_bytes() {
        let pattern = [Atom::U32];
        let err = load(&pattern, &[0, 0, 0, 1, 9]).unwrap_err();
        assert!(matches!(err, CoreError::Corrupt(_)));
    }

    #[test]
    fn rejects_short_buffer() {
        let pattern = [Atom::U64];
        let err = load(&pattern, &[0, 0, 0]).unwrap_err();
        assert!(matches!(err, CoreError::Corrupt(_)));
    }

    #[test]
    fn array_round_trip() {
        let values: Vec<u64> = vec![1, 2, 3, u64::MAX];
        let bytes = dump_array(&values);
        assert_eq!(load_array::<u64>(&bytes).unwrap(), values);
    }
}
