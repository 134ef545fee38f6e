//! Per-request attention key/value history.
//!
//! Both buffers are laid out `[capacity, n_layers, batch_size, n_kv_heads, head_dim]`
//! with the token position outermost, so the written prefix is always one
//! contiguous host slice. Views borrow it; a backend that runs on a device
//! copies the prefix over on every step.

use crate::{
    error::ServiceError,
    model::{
        Hyperparameters,
        tensor::{HostTensor, element_count},
    },
};

/// Read-only view of the valid prefix of one cache buffer.
#[derive(Debug, Clone, Copy)]
pub struct CacheView<'a> {
    shape: [usize; 5],
    data: &'a [f32],
}

impl<'a> CacheView<'a> {
    /// `[len, n_layers, batch_size, n_kv_heads, head_dim]`
    pub fn shape(&self) -> [usize; 5] {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.shape[0]
    }

    pub fn is_empty(&self) -> bool {
        self.shape[0] == 0
    }

    pub fn as_slice(&self) -> &'a [f32] {
        self.data
    }

    /// Every layer/batch/head entry stored for token position `pos`.
    pub fn position(&self, pos: usize) -> Option<&'a [f32]> {
        let stride = self.shape[1..].iter().product::<usize>();
        if pos < self.len() {
            Some(&self.data[pos * stride..(pos + 1) * stride])
        } else {
            None
        }
    }
}

pub struct KvCache {
    keys: Vec<f32>,
    values: Vec<f32>,
    capacity: usize,
    n_layers: usize,
    batch_size: usize,
    n_kv_heads: usize,
    head_dim: usize,
    cursor: usize,
}

impl KvCache {
    pub fn create(
        hyperparams: &Hyperparameters,
        max_tokens: usize,
        batch_size: usize,
    ) -> Result<Self, ServiceError> {
        if max_tokens == 0 {
            return Err(ServiceError::Configuration("max_tokens must be positive".into()));
        }
        if batch_size == 0 {
            return Err(ServiceError::Configuration("batch_size must be at least 1".into()));
        }

        let shape = [
            max_tokens,
            hyperparams.n_layers(),
            batch_size,
            hyperparams.n_kv_heads(),
            hyperparams.head_dim(),
        ];
        let elements = element_count(&shape)?;

        Ok(Self {
            keys: zeroed(elements)?,
            values: zeroed(elements)?,
            capacity: max_tokens,
            n_layers: hyperparams.n_layers(),
            batch_size,
            n_kv_heads: hyperparams.n_kv_heads(),
            head_dim: hyperparams.head_dim(),
            cursor: 0,
        })
    }

    pub fn keys_view(&self) -> CacheView<'_> {
        self.view(&self.keys)
    }

    pub fn values_view(&self) -> CacheView<'_> {
        self.view(&self.values)
    }

    /// Appends the slices produced by the step that just executed.
    ///
    /// Both tensors must be `[new_tokens, n_layers, batch_size, n_kv_heads, head_dim]`.
    /// Nothing is written if the append would run past capacity.
    pub fn update(&mut self, new_keys: &HostTensor, new_values: &HostTensor) -> Result<(), ServiceError> {
        let new_tokens = self.check_slice("keys", new_keys)?;
        let value_tokens = self.check_slice("values", new_values)?;
        if new_tokens != value_tokens {
            return Err(ServiceError::Execution(format!(
                "key update covers {new_tokens} positions but value update covers {value_tokens}"
            )));
        }

        let requested = self.cursor + new_tokens;
        if requested > self.capacity {
            return Err(ServiceError::CapacityExceeded {
                requested,
                capacity: self.capacity,
            });
        }

        let stride = self.position_stride();
        let range = self.cursor * stride..requested * stride;
        self.keys[range.clone()].copy_from_slice(new_keys.data());
        self.values[range].copy_from_slice(new_values.data());
        self.cursor = requested;
        Ok(())
    }

    /// Number of written token positions.
    pub fn len(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.cursor
    }

    pub fn is_full(&self) -> bool {
        self.cursor == self.capacity
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn position_stride(&self) -> usize {
        self.n_layers * self.batch_size * self.n_kv_heads * self.head_dim
    }

    fn view<'a>(&self, buffer: &'a [f32]) -> CacheView<'a> {
        CacheView {
            shape: [
                self.cursor,
                self.n_layers,
                self.batch_size,
                self.n_kv_heads,
                self.head_dim,
            ],
            data: &buffer[..self.cursor * self.position_stride()],
        }
    }

    fn check_slice(&self, name: &str, tensor: &HostTensor) -> Result<usize, ServiceError> {
        let expected_tail = [self.n_layers, self.batch_size, self.n_kv_heads, self.head_dim];
        match tensor.shape() {
            [tokens, tail @ ..] if tail == expected_tail.as_slice() && *tokens > 0 => Ok(*tokens),
            other => Err(ServiceError::Execution(format!(
                "{name} update has shape {other:?}, expected [n, {}, {}, {}, {}] with n > 0",
                self.n_layers, self.batch_size, self.n_kv_heads, self.head_dim
            ))),
        }
    }
}

fn zeroed(elements: usize) -> Result<Vec<f32>, ServiceError> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(elements).map_err(|e| {
        ServiceError::Allocation(format!("cannot reserve {elements} cache elements: {e}"))
    })?;
    buffer.resize(elements, 0.0);
    Ok(buffer)
}
