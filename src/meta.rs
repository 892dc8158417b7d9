//! Layout of build rows inside row-table segments.
//!
//! ```text
//!  ┌──────────┬─────────┬────────────────┬────────┬────────┬─────┐
//!  │ null map │ key len │ serialized key │ col 0  │ col 1  │ ... │
//!  │ n/8 B    │ u32     │ key len B      │ 8 B    │ u32+B  │     │
//!  └──────────┴─────────┴────────────────┴────────┴────────┴─────┘
//! ```
//!
//! Fixed-width columns always take 8 bytes (zeroed when NULL). Variable-width
//! columns are a `u32` length followed by the bytes.

use crate::chunk::{Datum, FieldType, TypeKind};
use crate::codec::{self, SerializeMode};
use crate::error::{JoinError, Result};

const KEY_LEN_SIZE: usize = size_of::<u32>();

#[derive(Debug)]
pub struct JoinTableMeta {
    /// Build-side column indexes stored in each row, in storage order.
    pub(crate) row_columns_order: Vec<usize>,
    pub(crate) column_types: Vec<FieldType>,
    /// Fixed width per stored column, `None` for variable width.
    pub(crate) column_sizes: Vec<Option<usize>>,
    pub(crate) serialize_modes: Vec<SerializeMode>,
    pub(crate) null_eq: Vec<bool>,
    pub(crate) build_key_types: Vec<FieldType>,
    pub(crate) probe_key_types: Vec<FieldType>,
    /// Rows carry an atomic "matched" flag written during probe.
    pub(crate) need_used_flag: bool,
    /// Rows whose key can never match are still stored for the residual scan.
    pub(crate) keep_invalid_key_rows: bool,
    null_map_len: usize,
}

impl JoinTableMeta {
    pub fn new(
        build_types: &[FieldType],
        build_key_types: Vec<FieldType>,
        probe_key_types: Vec<FieldType>,
        row_columns_order: Vec<usize>,
        null_eq: Vec<bool>,
        need_used_flag: bool,
        keep_invalid_key_rows: bool,
    ) -> Self {
        let key_count = build_key_types.len();
        let serialize_modes = build_key_types
            .iter()
            .zip(&probe_key_types)
            .map(|(b, p)| codec::serialize_mode(b, p, key_count))
            .collect();
        let column_types: Vec<FieldType> =
            row_columns_order.iter().map(|&i| build_types[i]).collect();
        let column_sizes = column_types.iter().map(FieldType::fixed_size).collect();
        let null_map_len = row_columns_order.len().div_ceil(8);
        Self {
            row_columns_order,
            column_types,
            column_sizes,
            serialize_modes,
            null_eq,
            build_key_types,
            probe_key_types,
            need_used_flag,
            keep_invalid_key_rows,
            null_map_len,
        }
    }

    pub fn stored_column_count(&self) -> usize {
        self.row_columns_order.len()
    }

    /// Appends `row` in stored layout with its serialized `key`.
    pub(crate) fn encode_row(&self, row: &[Datum], key: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let null_map_start = out.len();
        out.resize(null_map_start + self.null_map_len, 0);
        out.extend_from_slice(&(key.len() as u32).to_le_bytes());
        out.extend_from_slice(key);

        for (pos, (&col_idx, ty)) in self.row_columns_order.iter().zip(&self.column_types).enumerate() {
            let datum = row.get(col_idx).ok_or_else(|| {
                JoinError::Internal(format!("build row has no column {col_idx}"))
            })?;
            match (datum, ty.kind) {
                (Datum::Null, _) => {
                    out[null_map_start + pos / 8] |= 1 << (pos % 8);
                    match self.column_sizes[pos] {
                        Some(size) => out.resize(out.len() + size, 0),
                        None => out.extend_from_slice(&0_u32.to_le_bytes()),
                    }
                }
                (Datum::Int(v), TypeKind::Int) => out.extend_from_slice(&v.to_le_bytes()),
                (Datum::UInt(v), TypeKind::UInt) => out.extend_from_slice(&v.to_le_bytes()),
                (Datum::Float(v), TypeKind::Float) => out.extend_from_slice(&v.to_le_bytes()),
                (Datum::String(s), TypeKind::String) => {
                    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                    out.extend_from_slice(s.as_bytes());
                }
                (datum, kind) => {
                    return Err(JoinError::Internal(format!(
                        "column {col_idx} holds {datum:?}, expected {kind:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serialized key of a stored row.
    #[inline]
    pub(crate) fn key_of<'a>(&self, raw: &'a [u8]) -> &'a [u8] {
        let start = self.null_map_len + KEY_LEN_SIZE;
        let len = read_u32(raw, self.null_map_len) as usize;
        &raw[start..start + len]
    }

    /// Decodes the stored columns of a row, appending them to `out`.
    pub(crate) fn decode_columns(&self, raw: &[u8], out: &mut Vec<Datum>) {
        let key_len = read_u32(raw, self.null_map_len) as usize;
        let mut pos = self.null_map_len + KEY_LEN_SIZE + key_len;
        for (i, ty) in self.column_types.iter().enumerate() {
            let is_null = raw[i / 8] & (1 << (i % 8)) != 0;
            let width = match self.column_sizes[i] {
                Some(size) => size,
                None => {
                    let len = read_u32(raw, pos) as usize;
                    pos += KEY_LEN_SIZE;
                    len
                }
            };
            let bytes = &raw[pos..pos + width];
            pos += width;
            if is_null {
                out.push(Datum::Null);
                continue;
            }
            out.push(match ty.kind {
                TypeKind::Int => Datum::Int(i64::from_le_bytes(to_array(bytes))),
                TypeKind::UInt => Datum::UInt(u64::from_le_bytes(to_array(bytes))),
                TypeKind::Float => Datum::Float(f64::from_le_bytes(to_array(bytes))),
                TypeKind::String => Datum::String(String::from_utf8_lossy(bytes).into_owned()),
            });
        }
    }
}

#[inline(always)]
fn read_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

#[inline(always)]
fn to_array(bytes: &[u8]) -> [u8; 8] {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    arr
}
