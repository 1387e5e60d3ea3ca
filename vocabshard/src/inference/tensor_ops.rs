//! Tensor operations for sharded inference
//!
//! This module provides the dense kernels the pipeline components call:
//! - Matrix multiplication and transpose
//! - Element-wise addition
//! - Row gather from an embedding table
//! - Top-k and argmax with a deterministic tie-break
//!
//! All arithmetic is plain row-major f32 on the CPU.

use crate::errors::{Result, ShardError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// 2D Tensor
///
/// Shape convention: [rows, cols], e.g. [shard_width, embedding_dim] for a table slice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor2D {
    /// Row-major data storage
    pub data: Vec<f32>,
    /// Number of rows
    pub rows: usize,
    /// Number of columns
    pub cols: usize,
}

impl Tensor2D {
    /// Create a new tensor with given dimensions
    pub fn new(data: Vec<f32>, rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(ShardError::Shape(format!(
                "Data length {} doesn't match shape {}x{}={}",
                data.len(),
                rows,
                cols,
                rows * cols
            )));
        }
        Ok(Self { data, rows, cols })
    }

    /// Create a tensor filled with zeros
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            data: vec![0.0; rows * cols],
            rows,
            cols,
        }
    }

    /// Get element at (row, col)
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    /// Set element at (row, col)
    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        self.data[row * self.cols + col] = value;
    }

    /// Get a row as a slice
    pub fn row(&self, row: usize) -> &[f32] {
        let start = row * self.cols;
        &self.data[start..start + self.cols]
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Element-wise addition
    pub fn add(&self, other: &Tensor2D) -> Result<Tensor2D> {
        if self.shape() != other.shape() {
            return Err(ShardError::Shape(format!(
                "Shape mismatch for add: {}x{} vs {}x{}",
                self.rows, self.cols, other.rows, other.cols
            )));
        }

        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a + b)
            .collect();

        Ok(Tensor2D {
            data,
            rows: self.rows,
            cols: self.cols,
        })
    }

    /// Transpose the tensor
    pub fn transpose(&self) -> Tensor2D {
        let mut data = vec![0.0; self.data.len()];
        for i in 0..self.rows {
            for j in 0..self.cols {
                data[j * self.rows + i] = self.data[i * self.cols + j];
            }
        }
        Tensor2D {
            data,
            rows: self.cols,
            cols: self.rows,
        }
    }

    /// Extract a contiguous row range `[row_start, row_end)`
    ///
    /// Used to cut a full embedding table into per-shard slices.
    pub fn row_slice(&self, row_start: usize, row_end: usize) -> Result<Tensor2D> {
        if row_end > self.rows || row_start >= row_end {
            return Err(ShardError::Shape(format!(
                "Invalid row slice {}..{} for tensor with {} rows",
                row_start, row_end, self.rows
            )));
        }

        Ok(Tensor2D {
            data: self.data[row_start * self.cols..row_end * self.cols].to_vec(),
            rows: row_end - row_start,
            cols: self.cols,
        })
    }
}

/// 3D Tensor
///
/// Shape convention: [batch, seq_len, features]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor3D {
    pub data: Vec<f32>,
    pub batch: usize,
    pub rows: usize,
    pub cols: usize,
}

impl Tensor3D {
    pub fn new(data: Vec<f32>, batch: usize, rows: usize, cols: usize) -> Result<Self> {
        if data.len() != batch * rows * cols {
            return Err(ShardError::Shape(format!(
                "Data length {} doesn't match shape {}x{}x{}",
                data.len(),
                batch,
                rows,
                cols
            )));
        }
        Ok(Self {
            data,
            batch,
            rows,
            cols,
        })
    }

    pub fn zeros(batch: usize, rows: usize, cols: usize) -> Self {
        Self {
            data: vec![0.0; batch * rows * cols],
            batch,
            rows,
            cols,
        }
    }

    #[inline]
    pub fn get(&self, b: usize, row: usize, col: usize) -> f32 {
        self.data[(b * self.rows + row) * self.cols + col]
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.batch, self.rows, self.cols)
    }

    /// Copy out the matrix for one batch element
    pub fn matrix(&self, b: usize) -> Tensor2D {
        let size = self.rows * self.cols;
        Tensor2D {
            data: self.data[b * size..(b + 1) * size].to_vec(),
            rows: self.rows,
            cols: self.cols,
        }
    }

    /// Element-wise addition
    pub fn add(&self, other: &Tensor3D) -> Result<Tensor3D> {
        if self.shape() != other.shape() {
            return Err(ShardError::Shape(format!(
                "Shape mismatch for add: {:?} vs {:?}",
                self.shape(),
                other.shape()
            )));
        }
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a + b)
            .collect();
        Ok(Tensor3D {
            data,
            batch: self.batch,
            rows: self.rows,
            cols: self.cols,
        })
    }

    /// Swap the last two axes: [b, r, c] -> [b, c, r]
    pub fn transpose_inner(&self) -> Tensor3D {
        let matrices: Vec<Tensor2D> = (0..self.batch)
            .map(|b| self.matrix(b).transpose())
            .collect();
        let mut data = Vec::with_capacity(self.data.len());
        for m in matrices {
            data.extend(m.data);
        }
        Tensor3D {
            data,
            batch: self.batch,
            rows: self.cols,
            cols: self.rows,
        }
    }

    /// Drop a middle axis of size 1: [b, 1, c] -> [b, c]
    pub fn squeeze_middle(&self) -> Result<Tensor2D> {
        if self.rows != 1 {
            return Err(ShardError::Shape(format!(
                "cannot squeeze axis 1 of size {}",
                self.rows
            )));
        }
        Tensor2D::new(self.data.clone(), self.batch, self.cols)
    }
}

// ============== Matrix Operations ==============

/// Matrix multiplication: A[m, k] @ B[k, n] -> C[m, n]
pub fn matmul(a: &Tensor2D, b: &Tensor2D) -> Result<Tensor2D> {
    if a.cols != b.rows {
        return Err(ShardError::Shape(format!(
            "Matmul shape mismatch: {}x{} @ {}x{}",
            a.rows, a.cols, b.rows, b.cols
        )));
    }

    let m = a.rows;
    let k = a.cols;
    let n = b.cols;

    let mut result = vec![0.0; m * n];

    // i-p-j order keeps the inner loop on contiguous memory
    for i in 0..m {
        for p in 0..k {
            let a_ip = a.data[i * k + p];
            for j in 0..n {
                result[i * n + j] += a_ip * b.data[p * n + j];
            }
        }
    }

    Ok(Tensor2D {
        data: result,
        rows: m,
        cols: n,
    })
}

/// Batched matrix multiplication with a shared right operand:
/// A[b, m, k] @ B[k, n] -> C[b, m, n]
pub fn batched_matmul(a: &Tensor3D, b: &Tensor2D) -> Result<Tensor3D> {
    let mut data = Vec::with_capacity(a.batch * a.rows * b.cols);
    for i in 0..a.batch {
        data.extend(matmul(&a.matrix(i), b)?.data);
    }
    Tensor3D::new(data, a.batch, a.rows, b.cols)
}

// ============== Embedding Operations ==============

/// Gather rows of a table by index: table[rows, cols], indices[n] -> [n, cols]
pub fn gather_rows(table: &Tensor2D, indices: &[usize]) -> Result<Tensor2D> {
    let mut data = Vec::with_capacity(indices.len() * table.cols);
    for &idx in indices {
        if idx >= table.rows {
            return Err(ShardError::Shape(format!(
                "Row {} out of bounds for table with {} rows",
                idx, table.rows
            )));
        }
        data.extend_from_slice(table.row(idx));
    }
    Ok(Tensor2D {
        data,
        rows: indices.len(),
        cols: table.cols,
    })
}

// ============== Selection ==============

/// Ordering for ranked candidates: higher score first, then lower index.
///
/// Uses IEEE total ordering so that NaN scores still sort deterministically.
pub fn rank_order(a: (f32, usize), b: (f32, usize)) -> Ordering {
    b.0.total_cmp(&a.0).then(a.1.cmp(&b.1))
}

/// Top-k over a score vector, returning (score, index) pairs ranked by
/// [`rank_order`]. Returns fewer than k pairs when the vector is shorter.
pub fn top_k(scores: &[f32], k: usize) -> Vec<(f32, usize)> {
    let mut ranked: Vec<(f32, usize)> = scores.iter().copied().zip(0..).collect();
    ranked.sort_by(|a, b| rank_order(*a, *b));
    ranked.truncate(k);
    ranked
}

/// Index of the highest score, lowest index on ties
pub fn argmax(scores: &[f32]) -> Option<usize> {
    top_k(scores, 1).first().map(|&(_, idx)| idx)
}
