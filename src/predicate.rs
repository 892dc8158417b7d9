//! Boolean conditions evaluated by the join: single-side filters and the
//! "other condition" checked on candidate joined rows.

use crate::chunk::{Chunk, Datum};
use crate::error::Result;

pub trait Predicate: Send + Sync {
    fn eval(&self, row: &[Datum]) -> Result<bool>;

    /// Evaluates the predicate for every row of `chk`, overwriting `selected`.
    fn vectorized_filter(&self, chk: &Chunk, selected: &mut Vec<bool>) -> Result<()> {
        selected.clear();
        selected.reserve(chk.num_rows());
        for row in chk.rows() {
            selected.push(self.eval(row)?);
        }
        Ok(())
    }
}

impl<F> Predicate for F
where
    F: Fn(&[Datum]) -> Result<bool> + Send + Sync,
{
    fn eval(&self, row: &[Datum]) -> Result<bool> {
        self(row)
    }
}
