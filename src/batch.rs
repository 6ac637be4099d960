use tch::{Device, Tensor};

use crate::error::BatchError;

/// A token stream laid out as `batch_size` independent columns.
///
/// Column `c` is the contiguous run `stream[c * rows..(c + 1) * rows]`, so
/// reading down a column walks the original text in order. Storage is
/// row-major: `data[row * batch_size + col]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    rows: usize,
    batch_size: usize,
    data: Vec<i64>,
}

/// Reshapes a flat token stream into a `[rows, batch_size]` grid.
///
/// `rows = stream.len() / batch_size`; the trailing `stream.len() % batch_size`
/// tokens cannot fill a whole column and are dropped.
pub fn batchify(stream: &[i64], batch_size: usize) -> Result<Grid, BatchError> {
    if batch_size == 0 {
        return Err(BatchError::InvalidBatchSize);
    }
    if stream.is_empty() {
        return Err(BatchError::EmptyStream);
    }
    let rows = stream.len() / batch_size;
    let dropped = stream.len() - rows * batch_size;
    if dropped > 0 {
        tracing::debug!(dropped, batch_size, "dropping tail tokens that do not fill a column");
    }
    let mut data = Vec::with_capacity(rows * batch_size);
    for row in 0..rows {
        for col in 0..batch_size {
            data.push(stream[col * rows + row]);
        }
    }
    Ok(Grid {
        rows,
        batch_size,
        data,
    })
}

impl Grid {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Nominal number of windows of `max_len` rows, as shown in progress logs.
    pub fn num_batches(&self, max_len: usize) -> usize {
        if max_len == 0 { 0 } else { self.rows / max_len }
    }

    /// Cuts the (input, target) window starting at `start_row`.
    ///
    /// The window shrinks near the end of the grid so the target, which sits
    /// one row below the input, never runs past the last row. A `start_row`
    /// with no following row yields an empty window.
    pub fn window(&self, start_row: usize, max_len: usize) -> Window {
        let available = self.rows.saturating_sub(start_row.saturating_add(1));
        let seq_len = max_len.min(available);
        let b = self.batch_size;
        if seq_len == 0 {
            return Window {
                start_row,
                seq_len,
                batch_size: b,
                input: Vec::new(),
                target: Vec::new(),
            };
        }
        let input = self.data[start_row * b..(start_row + seq_len) * b].to_vec();
        let target = self.data[(start_row + 1) * b..(start_row + 1 + seq_len) * b].to_vec();
        Window {
            start_row,
            seq_len,
            batch_size: b,
            input,
            target,
        }
    }

    /// Iterates windows at `start_row = 0, max_len, 2 * max_len, ...` while
    /// at least one row follows the start row.
    pub fn windows(&self, max_len: usize) -> Result<Windows<'_>, BatchError> {
        if max_len == 0 {
            return Err(BatchError::InvalidWindowLength);
        }
        Ok(Windows {
            grid: self,
            max_len,
            next_row: 0,
        })
    }
}

/// One training step's worth of data: `seq_len` rows of input and the same
/// rows shifted down by one as next-token targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub start_row: usize,
    pub seq_len: usize,
    pub batch_size: usize,
    /// `[seq_len, batch_size]`, row-major.
    pub input: Vec<i64>,
    /// Flattened `[seq_len * batch_size]`, row-major.
    pub target: Vec<i64>,
}

impl Window {
    /// Returns `(input [seq_len, batch], target [seq_len * batch])` as Int64 tensors.
    pub fn to_tensors(&self, device: Device) -> (Tensor, Tensor) {
        let input = Tensor::from_slice(&self.input)
            .view([self.seq_len as i64, self.batch_size as i64])
            .to_device(device);
        let target = Tensor::from_slice(&self.target).to_device(device);
        (input, target)
    }
}

pub struct Windows<'a> {
    grid: &'a Grid,
    max_len: usize,
    next_row: usize,
}

impl Iterator for Windows<'_> {
    type Item = Window;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_row.saturating_add(1) >= self.grid.rows {
            return None;
        }
        let window = self.grid.window(self.next_row, self.max_len);
        self.next_row = self.next_row.saturating_add(self.max_len);
        Some(window)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.grid.rows.saturating_sub(self.next_row.saturating_add(1));
        let n = remaining.div_ceil(self.max_len);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Windows<'_> {}
