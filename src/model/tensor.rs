use crate::error::ServiceError;

/// Dense row-major f32 tensor living in host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl HostTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, ServiceError> {
        let expected = element_count(&shape)?;
        if expected != data.len() {
            return Err(ServiceError::Execution(format!(
                "tensor of shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Row `index` of a rank-2 tensor.
    pub fn row(&self, index: usize) -> Result<&[f32], ServiceError> {
        match self.shape.as_slice() {
            [rows, cols] if index < *rows => Ok(&self.data[index * cols..(index + 1) * cols]),
            [rows, _] => Err(ServiceError::Execution(format!(
                "row {index} out of bounds for {rows} rows"
            ))),
            other => Err(ServiceError::Execution(format!(
                "expected a rank-2 tensor, got shape {other:?}"
            ))),
        }
    }
}

/// Token ids submitted for one execution step, shaped `[batch_size, seq_len]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBatch {
    batch_size: usize,
    seq_len: usize,
    ids: Vec<i64>,
}

impl TokenBatch {
    /// Repeats the same token row for every batch entry.
    pub fn broadcast(tokens: &[u32], batch_size: usize) -> Self {
        let mut ids = Vec::with_capacity(tokens.len() * batch_size);
        for _ in 0..batch_size {
            ids.extend(tokens.iter().map(|&id| i64::from(id)));
        }
        Self {
            batch_size,
            seq_len: tokens.len(),
            ids,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.batch_size, self.seq_len]
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }
}

pub(crate) fn element_count(shape: &[usize]) -> Result<usize, ServiceError> {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| ServiceError::Allocation(format!("shape {shape:?} overflows usize")))
}
