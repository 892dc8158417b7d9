//! Row producers feeding the two sides of the join.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::chunk::{Chunk, FieldType, Row};
use crate::error::Result;

/// A child shared between the coordinator and the fetch thread reading it.
pub(crate) type SharedSource = Arc<Mutex<Box<dyn RowSource>>>;

/// A child operator. `next` fills the caller's chunk, clearing it first; an
/// empty chunk means the source is exhausted.
pub trait RowSource: Send {
    fn field_types(&self) -> &[FieldType];

    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn next(&mut self, chk: &mut Chunk) -> Result<()>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Serves a fixed set of rows, honoring the chunk's required rows. `open`
/// rewinds it so the same source can back several executions.
pub struct MemorySource {
    types: Vec<FieldType>,
    rows: Vec<Row>,
    pos: usize,
}

impl MemorySource {
    pub fn new(types: Vec<FieldType>, rows: Vec<Row>) -> Self {
        Self {
            types,
            rows,
            pos: 0,
        }
    }
}

impl RowSource for MemorySource {
    fn field_types(&self) -> &[FieldType] {
        &self.types
    }

    fn open(&mut self) -> Result<()> {
        self.pos = 0;
        Ok(())
    }

    fn next(&mut self, chk: &mut Chunk) -> Result<()> {
        chk.reset();
        let end = (self.pos + chk.required_rows().max(1)).min(self.rows.len());
        for row in &self.rows[self.pos..end] {
            chk.push_row(row.clone());
        }
        self.pos = end;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Datum;

    #[test]
    fn memory_source_batches_and_rewinds() {
        let rows: Vec<Row> = (0..5).map(|i| vec![Datum::Int(i)]).collect();
        let mut src = MemorySource::new(vec![FieldType::int()], rows);
        let mut chk = Chunk::new(2);

        let mut seen = 0;
        loop {
            src.next(&mut chk).unwrap();
            if chk.is_empty() {
                break;
            }
            assert!(chk.num_rows() <= 2);
            seen += chk.num_rows();
        }
        assert_eq!(seen, 5);

        src.open().unwrap();
        chk.set_required_rows(1, 2);
        src.next(&mut chk).unwrap();
        assert_eq!(chk.rows(), &[vec![Datum::Int(0)]]);
    }
}
