//! Eager TorchScript model with a Hugging Face tokenizer.

use std::{fs, ops::ControlFlow, path::Path};

use parking_lot::Mutex;
use tch::{Device, Kind, Tensor, no_grad};
use tokenizers::Tokenizer;

use crate::{
    backend::{Backend, EagerAdapter, EagerModel, EagerVariant},
    config::{AppConfig, BackendKind},
    error::{BackendError, ServiceError},
    model::GenerationParams,
};

const EOS_TOKENS: [&str; 3] = ["</s>", "<|endoftext|>", "<|eot_id|>"];

pub fn load(config: &AppConfig, kind: BackendKind) -> Result<Box<dyn Backend>, ServiceError> {
    let device = parse_device(&config.device);
    let variant = match kind {
        BackendKind::EagerCpu => EagerVariant::PromptIncluded,
        BackendKind::EagerGpu => EagerVariant::PromptExcluded,
        BackendKind::Batching => {
            return Err(ServiceError::ModelLoad(
                "TorchScript models do not support continuous batching".into(),
            ));
        }
    };

    let module_path = Path::new(&config.model_id).join("model.ts");
    tracing::info!(path = %module_path.display(), ?device, "loading TorchScript module");
    let model = TorchScriptModel::load(
        &module_path,
        &config.tokenizer_path,
        device,
        variant == EagerVariant::PromptIncluded,
    )?;
    tracing::info!(size_bytes = model.size_bytes, "model loaded");

    Ok(Box::new(EagerAdapter::new(
        model,
        variant,
        device_label(device),
        config.model_id.clone(),
    )))
}

pub struct TorchScriptModel {
    tokenizer: Tokenizer,
    module: Mutex<tch::CModule>,
    device: Device,
    eos_token_id: Option<i64>,
    decode_prompt: bool,
    size_bytes: u64,
}

impl TorchScriptModel {
    pub fn load(
        module_path: &Path,
        tokenizer_path: &Path,
        device: Device,
        decode_prompt: bool,
    ) -> Result<Self, ServiceError> {
        if !module_path.exists() {
            return Err(ServiceError::ModelLoad(format!(
                "model artifact missing: {}",
                module_path.display()
            )));
        }
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| ServiceError::ModelLoad(format!("tokenizer: {e}")))?;
        let size_bytes = fs::metadata(module_path)?.len();
        let mut module = tch::CModule::load_on_device(module_path, device)
            .map_err(|e| ServiceError::ModelLoad(e.to_string()))?;
        module.set_eval();

        let eos_token_id = EOS_TOKENS
            .iter()
            .find_map(|token| tokenizer.token_to_id(token))
            .map(i64::from);

        Ok(Self {
            tokenizer,
            module: Mutex::new(module),
            device,
            eos_token_id,
            decode_prompt,
            size_bytes,
        })
    }

    fn decode(&self, ids: &[i64], prompt_len: usize) -> Result<String, BackendError> {
        let start = if self.decode_prompt { 0 } else { prompt_len };
        let ids: Vec<u32> = ids[start..].iter().map(|&id| id as u32).collect();
        self.tokenizer
            .decode(&ids, true)
            .map_err(|e| BackendError::Tokenizer(e.to_string()))
    }

    fn next_token(&self, logits: Tensor, params: &GenerationParams) -> Result<i64, BackendError> {
        // [1, seq_len, vocab] -> [vocab] for the last position
        let last_logits = logits.select(1, -1).squeeze();
        if params.temperature <= 0.0 {
            return Ok(last_logits.argmax(0, false).int64_value(&[]));
        }
        let probs = (last_logits / params.temperature).softmax(-1, Kind::Float);
        if params.top_p >= 1.0 {
            return Ok(probs.multinomial(1, true).int64_value(&[0]));
        }

        let (sorted, indices) = probs.sort(-1, true);
        let sorted_probs = Vec::<f32>::try_from(&sorted.to_device(Device::Cpu))
            .map_err(|e| execution_error(e.to_string()))?;
        let keep = nucleus_len(&sorted_probs, params.top_p);
        let choice = sorted
            .narrow(0, 0, keep as i64)
            .multinomial(1, true)
            .int64_value(&[0]);
        Ok(indices.int64_value(&[choice]))
    }
}

/// How many of the probabilities, sorted in descending order, form the
/// smallest prefix whose mass reaches `top_p`. Never less than one.
fn nucleus_len(sorted_probs: &[f32], top_p: f64) -> usize {
    let mut mass = 0.0;
    for (idx, &p) in sorted_probs.iter().enumerate() {
        mass += f64::from(p);
        if mass >= top_p {
            return idx + 1;
        }
    }
    sorted_probs.len().max(1)
}

impl EagerModel for TorchScriptModel {
    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String, BackendError> {
        self.generate_with_progress(prompt, params, &mut |_| ControlFlow::Continue(()))
    }

    fn generate_with_progress(
        &self,
        prompt: &str,
        params: &GenerationParams,
        on_text: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<String, BackendError> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| BackendError::Tokenizer(e.to_string()))?;
        let mut input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| i64::from(id)).collect();
        if input_ids.is_empty() {
            input_ids.push(self.eos_token_id.unwrap_or(0));
        }
        let prompt_len = input_ids.len();
        if let Some(seed) = params.seed {
            tch::manual_seed(seed as i64);
        }

        no_grad(|| {
            let module = self.module.lock();

            for _ in 0..params.max_tokens {
                let input = Tensor::from_slice(&input_ids)
                    .reshape([1, input_ids.len() as i64])
                    .to(self.device);

                // traced modules return either the logits or (logits, past)
                let output = module
                    .forward_is(&[tch::IValue::Tensor(input)])
                    .map_err(|e| execution_error(e.to_string()))?;
                let logits = match output {
                    tch::IValue::Tensor(t) => t,
                    tch::IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                        tch::IValue::Tensor(t) => t.shallow_clone(),
                        _ => {
                            return Err(BackendError::Execution(
                                "expected a tensor as first tuple element".into(),
                            ));
                        }
                    },
                    _ => {
                        return Err(BackendError::Execution(
                            "unexpected model output format".into(),
                        ));
                    }
                };

                let next = self.next_token(logits, params)?;
                if Some(next) == self.eos_token_id {
                    break;
                }
                input_ids.push(next);

                if on_text(&self.decode(&input_ids, prompt_len)?).is_break() {
                    return Err(BackendError::Cancelled);
                }
            }
            Ok(())
        })?;

        self.decode(&input_ids, prompt_len)
    }
}

fn execution_error(message: String) -> BackendError {
    if message.contains("out of memory") {
        BackendError::OutOfMemory(message)
    } else {
        BackendError::Execution(message)
    }
}

fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            return Device::Cuda(idx);
        }
        tracing::warn!(requested = %raw, "CUDA unavailable, falling back to CPU");
    }
    Device::Cpu
}

fn device_label(device: Device) -> String {
    match device {
        Device::Cuda(idx) => format!("cuda:{idx}"),
        _ => "cpu".to_string(),
    }
}
