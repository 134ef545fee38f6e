//! TorchScript execution engine.
//!
//! The traced module's `forward` takes `(tokens, cache_keys, cache_values)` and
//! returns the tuple `(logits, new_keys, new_values)`, with the layouts
//! documented on [`ExecutionInputs`] and [`ExecutionOutputs`].

use std::{
    fs,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use tch::{CModule, Device, IValue, Kind, Tensor, no_grad};
use tracing::{info, warn};

use crate::{
    error::ServiceError,
    model::{
        ExecutionEngine, ExecutionInputs, ExecutionOutputs, Hyperparameters, HostTensor,
        engine::{OUTPUT_LOGITS, OUTPUT_NEW_KEYS, OUTPUT_NEW_VALUES},
        kv_cache::CacheView,
    },
    quantization::QuantizationEncoding,
};

pub struct TorchScriptEngine {
    name: String,
    hyperparams: Hyperparameters,
    encoding: Box<dyn QuantizationEncoding>,
    device: Device,
    size_bytes: u64,
    custom_ops: Vec<PathBuf>,
    module: Mutex<CModule>,
}

impl TorchScriptEngine {
    pub fn load(
        name: &str,
        module_path: &Path,
        hyperparams: Hyperparameters,
        encoding: Box<dyn QuantizationEncoding>,
        custom_ops: Vec<PathBuf>,
        use_gpu: bool,
    ) -> Result<Self, ServiceError> {
        if !module_path.exists() {
            return Err(ServiceError::Configuration(format!(
                "model artifact missing: {}",
                module_path.display()
            )));
        }
        let size_bytes = fs::metadata(module_path)?.len();
        let device = select_device(use_gpu);

        let mut module = CModule::load_on_device(module_path, device)
            .map_err(|e| ServiceError::Execution(e.to_string()))?;
        module.set_eval();

        info!(
            name,
            path = %module_path.display(),
            size_bytes,
            ?device,
            encoding = encoding.name(),
            custom_ops = custom_ops.len(),
            "loaded TorchScript module"
        );

        Ok(Self {
            name: name.to_string(),
            hyperparams,
            encoding,
            device,
            size_bytes,
            custom_ops,
            module: Mutex::new(module),
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn custom_ops(&self) -> &[PathBuf] {
        &self.custom_ops
    }

    /// Copies the whole cached prefix, so per-step transfer grows with length.
    fn cache_tensor(&self, view: CacheView<'_>) -> Tensor {
        let shape: Vec<i64> = view.shape().iter().map(|&d| d as i64).collect();
        Tensor::from_slice(view.as_slice())
            .reshape(shape.as_slice())
            .to_device(self.device)
    }
}

impl ExecutionEngine for TorchScriptEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn hyperparams(&self) -> &Hyperparameters {
        &self.hyperparams
    }

    fn encoding(&self) -> &dyn QuantizationEncoding {
        self.encoding.as_ref()
    }

    fn execute(&self, inputs: ExecutionInputs<'_>) -> Result<ExecutionOutputs, ServiceError> {
        let [batch, seq_len] = inputs.tokens.shape();
        let tokens = Tensor::from_slice(inputs.tokens.ids())
            .reshape([batch as i64, seq_len as i64])
            .to_device(self.device);
        let keys = self.cache_tensor(inputs.cache_keys);
        let values = self.cache_tensor(inputs.cache_values);

        let output = no_grad(|| {
            let module = self.module.lock();
            module.forward_is(&[
                IValue::Tensor(tokens),
                IValue::Tensor(keys),
                IValue::Tensor(values),
            ])
        })
        .map_err(|e| ServiceError::Execution(e.to_string()))?;

        let parts = match output {
            IValue::Tuple(parts) if parts.len() == 3 => parts,
            _ => {
                return Err(ServiceError::Execution(format!(
                    "expected ({OUTPUT_LOGITS}, {OUTPUT_NEW_KEYS}, {OUTPUT_NEW_VALUES}) from the module"
                )));
            }
        };
        let mut tensors = Vec::with_capacity(3);
        for (name, part) in [OUTPUT_LOGITS, OUTPUT_NEW_KEYS, OUTPUT_NEW_VALUES]
            .into_iter()
            .zip(parts)
        {
            match part {
                IValue::Tensor(t) => tensors.push(t),
                _ => {
                    return Err(ServiceError::Execution(format!(
                        "output '{name}' is not a tensor"
                    )));
                }
            }
        }
        let new_values = tensors.pop();
        let new_keys = tensors.pop();
        let logits = tensors.pop();
        let (Some(logits), Some(new_keys), Some(new_values)) = (logits, new_keys, new_values) else {
            return Err(ServiceError::Execution("module returned too few outputs".into()));
        };

        // Full-sequence logits: keep the last position only.
        let logits = if logits.dim() == 3 {
            logits.select(1, -1)
        } else {
            logits
        };

        Ok(ExecutionOutputs {
            logits: to_host(OUTPUT_LOGITS, &logits)?,
            new_keys: to_host(OUTPUT_NEW_KEYS, &new_keys)?,
            new_values: to_host(OUTPUT_NEW_VALUES, &new_values)?,
        })
    }
}

fn to_host(name: &str, tensor: &Tensor) -> Result<HostTensor, ServiceError> {
    let shape: Vec<usize> = tensor.size().iter().map(|&d| d as usize).collect();
    let flat = tensor
        .to_device(Device::Cpu)
        .to_kind(Kind::Float)
        .contiguous()
        .flatten(0, -1);
    let data = Vec::<f32>::try_from(&flat)
        .map_err(|e| ServiceError::Execution(format!("output '{name}': {e}")))?;
    HostTensor::new(shape, data)
}

fn select_device(use_gpu: bool) -> Device {
    if !use_gpu {
        return Device::Cpu;
    }
    if tch::Cuda::is_available() {
        Device::Cuda(0)
    } else {
        warn!("GPU requested but CUDA is not available; falling back to CPU");
        Device::Cpu
    }
}
