//! Low-rank adapter parameters
//! A small down/up projection pair trained alongside a frozen base weight.

use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use safetensors::{serialize, tensor::TensorView, Dtype as SafeDtype};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub struct LoraAdapter {
    pub down: Var,
    pub up: Var,
    pub scale: f64,
}

impl LoraAdapter {
    pub fn new(
        in_features: usize,
        out_features: usize,
        rank: usize,
        alpha: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        // Gaussian down, zero up: the adapter starts as an exact no-op.
        let down_tensor = Tensor::randn(0.0f32, 0.02f32, (rank, in_features), device)?
            .to_dtype(dtype)?;
        let up_tensor = Tensor::zeros((out_features, rank), dtype, device)?;

        Ok(Self {
            down: Var::from_tensor(&down_tensor)?,
            up: Var::from_tensor(&up_tensor)?,
            scale: alpha / rank as f64,
        })
    }

    /// Base linear plus the scaled low-rank update.
    pub fn forward(
        &self,
        input: &Tensor,
        base_weight: &Tensor,
        base_bias: Option<&Tensor>,
    ) -> Result<Tensor> {
        let weight_t = base_weight.contiguous()?.t()?;

        let (input_2d, original_shape) = if input.dims().len() == 3 {
            let (b, s, d) = input.dims3()?;
            (input.reshape((b * s, d))?, Some((b, s)))
        } else {
            (input.clone(), None)
        };

        let out_d = base_weight.dims()[0];
        let mut output = input_2d.matmul(&weight_t)?;

        let down_out = input_2d.matmul(&self.down.as_tensor().contiguous()?.t()?)?;
        let lora_out = down_out.matmul(&self.up.as_tensor().contiguous()?.t()?)?;
        output = (output + (lora_out * self.scale)?)?;

        let mut output = if let Some((b, s)) = original_shape {
            output.reshape((b, s, out_d))?
        } else {
            output
        };
        if let Some(bias) = base_bias {
            output = output.broadcast_add(bias)?;
        }
        Ok(output)
    }

    pub fn vars(&self) -> Vec<&Var> {
        vec![&self.down, &self.up]
    }
}

/// Named collection of adapters, one per adapted layer.
pub struct LoraCollection {
    pub adapters: HashMap<String, LoraAdapter>,
    pub rank: usize,
    pub alpha: f64,
    pub dtype: DType,
}

impl LoraCollection {
    pub fn new(rank: usize, alpha: f64, dtype: DType) -> Self {
        Self {
            adapters: HashMap::new(),
            rank,
            alpha,
            dtype,
        }
    }

    pub fn add(&mut self, name: &str, in_dim: usize, out_dim: usize, device: &Device) -> Result<()> {
        self.adapters.insert(
            name.to_string(),
            LoraAdapter::new(in_dim, out_dim, self.rank, self.alpha, device, self.dtype)?,
        );
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// All trainable variables, for the loss regularizer.
    pub fn vars(&self) -> Vec<&Var> {
        let mut vars = Vec::new();
        for adapter in self.adapters.values() {
            vars.extend(adapter.vars());
        }
        vars
    }

    /// Stable name -> Var pairs for optimizer parameter groups. Sorted so
    /// update order is deterministic across runs.
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        let mut names: Vec<&String> = self.adapters.keys().collect();
        names.sort();
        let mut out = Vec::with_capacity(names.len() * 2);
        for name in names {
            let adapter = &self.adapters[name];
            out.push((format!("{}.lora_down", name), adapter.down.clone()));
            out.push((format!("{}.lora_up", name), adapter.up.clone()));
        }
        out
    }

    /// Save adapter weights with ComfyUI-compatible key naming.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.save_with_prefix(path, "lora_unet")
    }

    pub fn save_with_prefix(&self, path: &Path, prefix: &str) -> Result<()> {
        let mut tensor_data = Vec::new();
        let mut tensor_info = Vec::new();

        let mut names: Vec<&String> = self.adapters.keys().collect();
        names.sort();
        for name in names {
            let adapter = &self.adapters[name];
            let key_base = name.replace('.', "_");

            let down_tensor = adapter.down.as_tensor();
            tensor_info.push((
                format!("{}_{}.lora_down.weight", prefix, key_base),
                convert_dtype(down_tensor.dtype())?,
                down_tensor.dims().to_vec(),
                tensor_data.len(),
            ));
            tensor_data.push(tensor_to_vec(down_tensor)?);

            let up_tensor = adapter.up.as_tensor();
            tensor_info.push((
                format!("{}_{}.lora_up.weight", prefix, key_base),
                convert_dtype(up_tensor.dtype())?,
                up_tensor.dims().to_vec(),
                tensor_data.len(),
            ));
            tensor_data.push(tensor_to_vec(up_tensor)?);
        }

        let mut tensors = HashMap::new();
        for (name, dtype, shape, idx) in tensor_info {
            tensors.insert(name, TensorView::new(dtype, shape, &tensor_data[idx])?);
        }

        let mut metadata = HashMap::new();
        metadata.insert("ss_network_rank".to_string(), self.rank.to_string());
        metadata.insert("ss_network_alpha".to_string(), self.alpha.to_string());
        metadata.insert("ss_network_module".to_string(), "networks.lora".to_string());
        metadata.insert("ss_network_dim".to_string(), self.rank.to_string());

        let data = serialize(&tensors, &Some(metadata))?;
        fs::write(path, data)?;
        Ok(())
    }
}

pub(crate) fn convert_dtype(dtype: DType) -> Result<SafeDtype> {
    match dtype {
        DType::F32 => Ok(SafeDtype::F32),
        DType::F16 => Ok(SafeDtype::F16),
        DType::BF16 => Ok(SafeDtype::BF16),
        DType::U8 => Ok(SafeDtype::U8),
        DType::U32 => Ok(SafeDtype::U32),
        DType::I64 => Ok(SafeDtype::I64),
        _ => Err(anyhow::anyhow!("Unsupported dtype for safetensors: {:?}", dtype)),
    }
}

pub(crate) fn tensor_to_vec(tensor: &Tensor) -> Result<Vec<u8>> {
    let flattened = tensor.flatten_all()?;

    let data = match tensor.dtype() {
        DType::F32 => {
            let data: Vec<f32> = flattened.to_vec1()?;
            data.into_iter().flat_map(|f| f.to_le_bytes()).collect()
        }
        DType::F16 => {
            let data: Vec<half::f16> = flattened.to_vec1()?;
            data.into_iter().flat_map(|f| f.to_le_bytes()).collect()
        }
        DType::BF16 => {
            let data: Vec<half::bf16> = flattened.to_vec1()?;
            data.into_iter().flat_map(|f| f.to_le_bytes()).collect()
        }
        _ => return Err(anyhow::anyhow!("Unsupported tensor dtype for conversion")),
    };
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_adapter_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let adapter = LoraAdapter::new(8, 4, 2, 2.0, &device, DType::F32)?;
        let base = Tensor::randn(0f32, 1f32, (4, 8), &device)?;
        let x = Tensor::randn(0f32, 1f32, (3, 8), &device)?;

        // Up projection starts at zero, so output equals the base linear.
        let with_lora = adapter.forward(&x, &base, None)?;
        let base_only = x.matmul(&base.t()?)?;
        let diff = (with_lora - base_only)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn test_named_vars_deterministic_order() -> Result<()> {
        let device = Device::Cpu;
        let mut collection = LoraCollection::new(2, 2.0, DType::F32);
        collection.add("b.to_v", 8, 8, &device)?;
        collection.add("a.to_q", 8, 8, &device)?;
        let names: Vec<String> = collection.named_vars().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["a.to_q.lora_down", "a.to_q.lora_up", "b.to_v.lora_down", "b.to_v.lora_up"]
        );
        Ok(())
    }

    #[test]
    fn test_save_writes_safetensors() -> Result<()> {
        let device = Device::Cpu;
        let mut collection = LoraCollection::new(2, 2.0, DType::F32);
        collection.add("down_blocks.0.attn1.to_q", 8, 8, &device)?;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("lora.safetensors");
        collection.save(&path)?;
        assert!(path.exists());
        let loaded = candle_core::safetensors::load(&path, &device)?;
        assert!(loaded.contains_key("lora_unet_down_blocks_0_attn1_to_q.lora_down.weight"));
        Ok(())
    }
}
