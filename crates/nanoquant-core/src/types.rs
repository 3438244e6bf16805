//! Model data types shared by the operators, the dispatcher and the collaborators.

use crate::error::{Error, Result};

/// Row-major 2-D weight tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl WeightMatrix {
    /// Create a matrix from row-major data.
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if rows.checked_mul(cols) != Some(data.len()) {
            return Err(Error::shape_mismatch((rows, cols), (data.len(), 1)));
        }
        Ok(Self { rows, cols, data })
    }

    /// Create a zero-filled matrix.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Create a matrix from nested rows. All rows must have the same length.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            if row.len() != cols {
                return Err(Error::shape_mismatch((rows.len(), cols), (rows.len(), row.len())));
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }

    /// Number of rows (output features).
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns (input features).
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// `(rows, cols)`.
    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Total number of elements.
    #[inline]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// True if the matrix has no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Consume the matrix and return its row-major data.
    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Element at `(row, col)`.
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    /// Borrow one row.
    #[inline]
    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    /// Mutably borrow one row.
    #[inline]
    pub fn row_mut(&mut self, row: usize) -> &mut [f32] {
        let cols = self.cols;
        &mut self.data[row * cols..(row + 1) * cols]
    }

    /// True if every element is finite.
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Replace the contents with a same-shaped matrix.
    pub fn replace(&mut self, other: WeightMatrix) -> Result<()> {
        if other.shape() != self.shape() {
            return Err(Error::shape_mismatch(self.shape(), other.shape()));
        }
        self.data = other.data;
        Ok(())
    }

    /// `self + scale * (b · a)` for `b: rows×r` and `a: r×cols`.
    pub fn add_scaled_product(&mut self, b: &WeightMatrix, a: &WeightMatrix, scale: f32) -> Result<()> {
        if b.rows != self.rows || a.cols != self.cols || b.cols != a.rows {
            return Err(Error::shape_mismatch(self.shape(), (b.rows, a.cols)));
        }
        for i in 0..self.rows {
            for k in 0..b.cols {
                let coeff = scale * b.get(i, k);
                if coeff == 0.0 {
                    continue;
                }
                let a_row = a.row(k);
                for (dst, &src) in self.row_mut(i).iter_mut().zip(a_row) {
                    *dst += coeff * src;
                }
            }
        }
        Ok(())
    }
}

/// A named linear layer: weight, optional bias and the keep-mask left by pruning.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearLayer {
    pub name: String,
    pub weight: WeightMatrix,
    pub bias: Option<Vec<f32>>,
    /// Keep-mask from the most recent pruning stage (`true` = kept).
    pub mask: Option<Vec<bool>>,
}

impl LinearLayer {
    pub fn new(name: impl Into<String>, weight: WeightMatrix) -> Self {
        Self {
            name: name.into(),
            weight,
            bias: None,
            mask: None,
        }
    }

    pub fn with_bias(mut self, bias: Vec<f32>) -> Self {
        self.bias = Some(bias);
        self
    }

    /// Zero every weight the stored keep-mask marks as pruned.
    pub fn apply_mask(&mut self) {
        if let Some(mask) = &self.mask {
            for (w, &keep) in self.weight.as_mut_slice().iter_mut().zip(mask) {
                if !keep {
                    *w = 0.0;
                }
            }
        }
    }

    /// True if `target` names this layer exactly or as a dotted suffix.
    pub fn matches_target(&self, target: &str) -> bool {
        self.name == target
            || self
                .name
                .strip_suffix(target)
                .is_some_and(|prefix| prefix.ends_with('.'))
    }
}

/// Low-rank adapter attached to one linear layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LoraAdapter {
    /// Name of the layer the adapter wraps.
    pub layer: String,
    pub r: usize,
    pub alpha: u32,
    pub dropout: f32,
    /// `alpha / r`.
    pub scaling: f32,
    /// Down projection, `r × in_features`.
    pub a: WeightMatrix,
    /// Up projection, `out_features × r`.
    pub b: WeightMatrix,
}

/// In-memory model: linear layers in ingestion order plus attached adapters.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelHandle {
    pub model_id: String,
    pub layers: Vec<LinearLayer>,
    pub adapters: Vec<LoraAdapter>,
}

impl ModelHandle {
    pub fn new(model_id: impl Into<String>, layers: Vec<LinearLayer>) -> Self {
        Self {
            model_id: model_id.into(),
            layers,
            adapters: Vec::new(),
        }
    }

    pub fn layer(&self, name: &str) -> Option<&LinearLayer> {
        self.layers.iter().find(|l| l.name == name)
    }

    pub fn layer_mut(&mut self, name: &str) -> Option<&mut LinearLayer> {
        self.layers.iter_mut().find(|l| l.name == name)
    }

    /// Total number of weight elements across layers.
    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(|l| l.weight.numel()).sum()
    }

    /// Adapter attached to `layer`, if any.
    pub fn adapter(&self, layer: &str) -> Option<&LoraAdapter> {
        self.adapters.iter().find(|a| a.layer == layer)
    }
}

/// Result of ingesting a model: the handle plus family metadata.
#[derive(Debug, Clone)]
pub struct IngestedModel {
    pub handle: ModelHandle,
    pub family: String,
    /// Layer names (or dotted suffixes) that receive LoRA adapters.
    pub target_modules: Vec<String>,
}

/// Files written for one persisted artifact.
#[derive(Debug, Clone, Default)]
pub struct StoredArtifact {
    /// Weights file, if the store writes one.
    pub weights_file: Option<std::path::PathBuf>,
    /// Checksum of the weights file.
    pub checksum: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_bad_length() {
        assert!(WeightMatrix::new(2, 2, vec![1.0; 3]).is_err());
        let m = WeightMatrix::new(2, 3, vec![0.0; 6]).unwrap();
        assert_eq!(m.shape(), (2, 3));
    }

    #[test]
    fn test_from_rows() {
        let m = WeightMatrix::from_rows(&[vec![1.0, -2.0], vec![3.0, -4.0]]).unwrap();
        assert_eq!(m.get(1, 0), 3.0);
        assert_eq!(m.row(0), &[1.0, -2.0]);
        assert!(WeightMatrix::from_rows(&[vec![1.0], vec![1.0, 2.0]]).is_err());
    }

    #[test]
    fn test_replace_requires_same_shape() {
        let mut m = WeightMatrix::zeros(2, 2);
        assert!(m.replace(WeightMatrix::zeros(1, 4)).is_err());
        assert!(m.replace(WeightMatrix::new(2, 2, vec![1.0; 4]).unwrap()).is_ok());
        assert_eq!(m.as_slice(), &[1.0; 4]);
    }

    #[test]
    fn test_add_scaled_product() {
        let mut w = WeightMatrix::zeros(2, 2);
        let b = WeightMatrix::new(2, 1, vec![1.0, 2.0]).unwrap();
        let a = WeightMatrix::new(1, 2, vec![3.0, 4.0]).unwrap();
        w.add_scaled_product(&b, &a, 0.5).unwrap();
        assert_eq!(w.as_slice(), &[1.5, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_target_matching() {
        let layer = LinearLayer::new("model.layers.0.self_attn.q_proj", WeightMatrix::zeros(1, 1));
        assert!(layer.matches_target("q_proj"));
        assert!(layer.matches_target("self_attn.q_proj"));
        assert!(!layer.matches_target("proj"));
        assert!(!layer.matches_target("v_proj"));
    }

    #[test]
    fn test_apply_mask() {
        let mut layer = LinearLayer::new("fc", WeightMatrix::new(1, 3, vec![1.0, 2.0, 3.0]).unwrap());
        layer.mask = Some(vec![true, false, true]);
        layer.apply_mask();
        assert_eq!(layer.weight.as_slice(), &[1.0, 0.0, 3.0]);
    }
}
