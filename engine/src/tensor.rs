use serde::{Deserialize, Serialize};

/// A dense tensor of f32 values stored in row major order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "Tensor data length does not match shape {:?}",
            shape
        );

        Self { shape, data }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();

        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let len = shape.iter().product();

        Self {
            shape,
            data: vec![value; len],
        }
    }

    pub fn from_vec(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn num_rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    pub fn row(&self, index: usize) -> &[f32] {
        let width = self.row_width();

        &self.data[index * width..(index + 1) * width]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks(self.row_width())
    }

    // Appends a row to a rank 2 tensor, growing the leading dimension.
    pub fn push_row(&mut self, row: &[f32]) {
        assert_eq!(self.shape.len(), 2, "push_row requires a rank 2 tensor");
        assert_eq!(
            self.shape[1],
            row.len(),
            "Row width does not match tensor width"
        );

        self.data.extend_from_slice(row);
        self.shape[0] += 1;
    }

    // Deserialized tensors are not guaranteed to be well formed.
    pub fn is_consistent(&self) -> bool {
        self.numel() == self.data.len()
    }

    fn row_width(&self) -> usize {
        self.shape.last().copied().unwrap_or(1).max(1)
    }
}
