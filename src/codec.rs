//! Join key serialization.
//!
//! Keys from both sides go through [`serialize_keys`] with the same modes, so
//! equal keys produce equal bytes regardless of the side that wrote them. The
//! bytes are hashed for partition routing and compared for equality on probe.

use crate::chunk::{Chunk, Datum, FieldType, TypeKind};
use crate::error::{JoinError, Result};

const NULL_FLAG: u8 = 0;
const NOT_NULL_FLAG: u8 = 1;
const NEGATIVE_FLAG: u8 = 0;
const NON_NEGATIVE_FLAG: u8 = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SerializeMode {
    Normal,
    /// Signed and unsigned integers meet on this key: prefix a sign byte so
    /// that `-1` and `u64::MAX` stay distinct.
    NeedSignFlag,
    /// The key has several columns and this one is variable-width: prefix the
    /// length so `("ab", "c")` and `("a", "bc")` differ.
    KeepVarColumnLength,
}

/// Picks the mode for one key column given both sides' types and the number
/// of key columns.
pub fn serialize_mode(build: &FieldType, probe: &FieldType, key_count: usize) -> SerializeMode {
    match (build.kind, probe.kind) {
        (TypeKind::Int, TypeKind::UInt) | (TypeKind::UInt, TypeKind::Int) => {
            SerializeMode::NeedSignFlag
        }
        (TypeKind::String, _) if key_count > 1 => SerializeMode::KeepVarColumnLength,
        _ => SerializeMode::Normal,
    }
}

/// Whether a build key type can ever equal a probe key type.
pub fn comparable(build: &FieldType, probe: &FieldType) -> bool {
    matches!(
        (build.kind, probe.kind),
        (TypeKind::Int | TypeKind::UInt, TypeKind::Int | TypeKind::UInt)
            | (TypeKind::Float, TypeKind::Float)
            | (TypeKind::String, TypeKind::String)
    )
}

/// Appends the serialized value of column `col_idx` to `buffers[i]` for every
/// row `i` of `chk`.
///
/// Rows already excluded by `filter` are skipped. A NULL value marks the row
/// in `null_vector` unless `null_eq` is set, in which case NULL is serialized
/// as a value of its own.
#[allow(clippy::too_many_arguments)]
pub fn serialize_keys(
    chk: &Chunk,
    ty: &FieldType,
    col_idx: usize,
    filter: Option<&[bool]>,
    null_vector: &mut [bool],
    null_eq: bool,
    mode: SerializeMode,
    buffers: &mut [Vec<u8>],
) -> Result<()> {
    for (i, row) in chk.rows().iter().enumerate() {
        if filter.is_some_and(|f| !f[i]) || null_vector[i] {
            continue;
        }
        let buf = &mut buffers[i];
        let datum = row.get(col_idx).ok_or_else(|| JoinError::Codec {
            column: col_idx,
            message: format!("row {i} has only {} columns", row.len()),
        })?;
        if datum.is_null() {
            if null_eq {
                buf.push(NULL_FLAG);
            } else {
                null_vector[i] = true;
            }
            continue;
        }
        if null_eq {
            buf.push(NOT_NULL_FLAG);
        }
        serialize_datum(datum, ty, mode, buf).map_err(|message| JoinError::Codec {
            column: col_idx,
            message,
        })?;
    }
    Ok(())
}

fn serialize_datum(
    datum: &Datum,
    ty: &FieldType,
    mode: SerializeMode,
    buf: &mut Vec<u8>,
) -> std::result::Result<(), String> {
    match (datum, ty.kind) {
        (Datum::Int(v), TypeKind::Int) => {
            if mode == SerializeMode::NeedSignFlag {
                buf.push(if *v < 0 { NEGATIVE_FLAG } else { NON_NEGATIVE_FLAG });
            }
            buf.extend_from_slice(&v.to_le_bytes());
        }
        (Datum::UInt(v), TypeKind::UInt) => {
            if mode == SerializeMode::NeedSignFlag {
                buf.push(NON_NEGATIVE_FLAG);
            }
            buf.extend_from_slice(&v.to_le_bytes());
        }
        (Datum::Float(v), TypeKind::Float) => {
            // -0.0 == 0.0 and every NaN compares as one value.
            let v = if *v == 0.0 {
                0.0
            } else if v.is_nan() {
                f64::NAN
            } else {
                *v
            };
            buf.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        (Datum::String(s), TypeKind::String) => {
            if mode == SerializeMode::KeepVarColumnLength {
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            }
            buf.extend_from_slice(s.as_bytes());
        }
        (datum, kind) => return Err(format!("value {datum:?} does not match type {kind:?}")),
    }
    Ok(())
}

/// 64-bit hash of a serialized key.
#[inline(always)]
pub fn hash_key(key: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serialize_one(
        rows: Vec<Vec<Datum>>,
        ty: FieldType,
        null_eq: bool,
        mode: SerializeMode,
    ) -> (Vec<Vec<u8>>, Vec<bool>) {
        let chk = Chunk::from_rows(rows);
        let mut buffers = vec![Vec::new(); chk.num_rows()];
        let mut nulls = vec![false; chk.num_rows()];
        serialize_keys(&chk, &ty, 0, None, &mut nulls, null_eq, mode, &mut buffers).unwrap();
        (buffers, nulls)
    }

    #[test]
    fn nulls_are_marked_unless_null_eq() {
        let rows = vec![vec![Datum::Null], vec![Datum::Int(1)]];
        let (bufs, nulls) = serialize_one(rows.clone(), FieldType::int(), false, SerializeMode::Normal);
        assert_eq!(nulls, vec![true, false]);
        assert!(bufs[0].is_empty());

        let (bufs, nulls) = serialize_one(rows, FieldType::int(), true, SerializeMode::Normal);
        assert_eq!(nulls, vec![false, false]);
        assert_eq!(bufs[0], vec![NULL_FLAG]);
        assert_eq!(bufs[1][0], NOT_NULL_FLAG);
    }

    #[test]
    fn sign_flag_separates_negative_from_large_unsigned() {
        let (signed, _) = serialize_one(
            vec![vec![Datum::Int(-1)]],
            FieldType::int(),
            false,
            SerializeMode::NeedSignFlag,
        );
        let (unsigned, _) = serialize_one(
            vec![vec![Datum::UInt(u64::MAX)]],
            FieldType::uint(),
            false,
            SerializeMode::NeedSignFlag,
        );
        assert_ne!(signed[0], unsigned[0]);

        let (a, _) = serialize_one(vec![vec![Datum::Int(7)]], FieldType::int(), false, SerializeMode::NeedSignFlag);
        let (b, _) = serialize_one(vec![vec![Datum::UInt(7)]], FieldType::uint(), false, SerializeMode::NeedSignFlag);
        assert_eq!(a, b);
    }

    #[test]
    fn float_zero_and_nan_normalize() {
        let (bufs, _) = serialize_one(
            vec![
                vec![Datum::Float(0.0)],
                vec![Datum::Float(-0.0)],
                vec![Datum::Float(f64::NAN)],
                vec![Datum::Float(-f64::NAN)],
            ],
            FieldType::float(),
            false,
            SerializeMode::Normal,
        );
        assert_eq!(bufs[0], bufs[1]);
        assert_eq!(bufs[2], bufs[3]);
    }

    #[test]
    fn multi_column_strings_keep_lengths() {
        let chk = Chunk::from_rows(vec![
            vec![Datum::from("ab"), Datum::from("c")],
            vec![Datum::from("a"), Datum::from("bc")],
        ]);
        let ty = FieldType::string();
        let mode = serialize_mode(&ty, &ty, 2);
        assert_eq!(mode, SerializeMode::KeepVarColumnLength);

        let mut buffers = vec![Vec::new(); 2];
        let mut nulls = vec![false; 2];
        for col in 0..2 {
            serialize_keys(&chk, &ty, col, None, &mut nulls, false, mode, &mut buffers).unwrap();
        }
        assert_ne!(buffers[0], buffers[1]);
        assert_ne!(hash_key(&buffers[0]), hash_key(&buffers[1]));
    }

    #[test]
    fn filtered_rows_are_skipped() {
        let chk = Chunk::from_rows(vec![vec![Datum::Int(1)], vec![Datum::Int(2)]]);
        let mut buffers = vec![Vec::new(); 2];
        let mut nulls = vec![false; 2];
        let filter = [false, true];
        serialize_keys(
            &chk,
            &FieldType::int(),
            0,
            Some(&filter),
            &mut nulls,
            false,
            SerializeMode::Normal,
            &mut buffers,
        )
        .unwrap();
        assert!(buffers[0].is_empty());
        assert_eq!(buffers[1], 2_i64.to_le_bytes().to_vec());
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let chk = Chunk::from_rows(vec![vec![Datum::from("x")]]);
        let mut buffers = vec![Vec::new()];
        let mut nulls = vec![false];
        let err = serialize_keys(
            &chk,
            &FieldType::int(),
            0,
            None,
            &mut nulls,
            false,
            SerializeMode::Normal,
            &mut buffers,
        )
        .unwrap_err();
        assert!(matches!(err, JoinError::Codec { column: 0, .. }));
    }
}
