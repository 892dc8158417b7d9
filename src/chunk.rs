//! Minimal row container exchanged between the join and its inputs.
//!
//! A [`Chunk`] is a batch of rows with a soft capacity. Producers fill it up to
//! [`Chunk::required_rows`]; an empty chunk returned by a source means the
//! source is exhausted.

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Int,
    UInt,
    Float,
    String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FieldType {
    pub kind: TypeKind,
    pub nullable: bool,
}

impl FieldType {
    pub const fn new(kind: TypeKind) -> Self {
        Self {
            kind,
            nullable: true,
        }
    }

    pub const fn int() -> Self {
        Self::new(TypeKind::Int)
    }

    pub const fn uint() -> Self {
        Self::new(TypeKind::UInt)
    }

    pub const fn float() -> Self {
        Self::new(TypeKind::Float)
    }

    pub const fn string() -> Self {
        Self::new(TypeKind::String)
    }

    pub const fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Width in bytes when stored in a row, `None` for variable-width types.
    pub fn fixed_size(&self) -> Option<usize> {
        match self.kind {
            TypeKind::Int | TypeKind::UInt | TypeKind::Float => Some(8),
            TypeKind::String => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Datum {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int(v)
    }
}

impl From<u64> for Datum {
    fn from(v: u64) -> Self {
        Datum::UInt(v)
    }
}

impl From<f64> for Datum {
    fn from(v: f64) -> Self {
        Datum::Float(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::String(v.to_string())
    }
}

impl<T: Into<Datum>> From<Option<T>> for Datum {
    fn from(v: Option<T>) -> Self {
        v.map_or(Datum::Null, Into::into)
    }
}

pub type Row = Vec<Datum>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Chunk {
    rows: Vec<Row>,
    capacity: usize,
    required_rows: usize,
}

impl Chunk {
    pub fn new(capacity: usize) -> Self {
        Self {
            rows: Vec::with_capacity(capacity),
            capacity,
            required_rows: capacity,
        }
    }

    pub fn from_rows(rows: Vec<Row>) -> Self {
        let capacity = rows.len();
        Self {
            rows,
            capacity,
            required_rows: capacity,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row(&self, idx: usize) -> &[Datum] {
        &self.rows[idx]
    }

    pub fn push_row(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Drops every row but keeps the allocation and the capacity.
    pub fn reset(&mut self) {
        self.rows.clear();
    }

    pub fn required_rows(&self) -> usize {
        self.required_rows
    }

    /// Limits how many rows a producer should put into this chunk. Zero or a
    /// value above `max_chunk_size` means "fill up to `max_chunk_size`".
    pub fn set_required_rows(&mut self, required: usize, max_chunk_size: usize) {
        self.required_rows = if required == 0 || required > max_chunk_size {
            max_chunk_size
        } else {
            required
        };
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.required_rows
    }

    /// Exchanges the rows of two chunks, leaving capacities untouched.
    pub fn swap_rows(&mut self, other: &mut Chunk) {
        std::mem::swap(&mut self.rows, &mut other.rows);
    }
}
