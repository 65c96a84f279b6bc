//! llama.cpp backend
//!
//! Runs on the engine worker thread. A fresh context is created per
//! generation, so a failed or cancelled reply never leaves stale KV cache
//! state behind for the next one.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::DecodeError;

use crate::inference::backend::{GenerationRequest, InferenceBackend, SamplingParams};
use crate::inference::engine::{EngineError, NativeEngine};
use crate::inference::streaming::FinishReason;
use crate::types::{ModelConfig, ModelInfo, Role, Turn};

/// llama.cpp through `llama-cpp-2`
pub struct LlamaCppBackend {
    backend: LlamaBackend,
    model: Option<LlamaModel>,
    config: Option<ModelConfig>,
    gpu_layers: u32,
}

impl LlamaCppBackend {
    /// Initialize the llama.cpp backend. Once per process.
    pub fn init() -> Result<Self, EngineError> {
        let backend = LlamaBackend::init().map_err(|e| EngineError::BackendInit(e.to_string()))?;
        tracing::info!("LlamaBackend initialized in worker thread");
        Ok(Self {
            backend,
            model: None,
            config: None,
            gpu_layers: 0,
        })
    }

    /// Offload layers to the GPU (0 = CPU only)
    pub fn with_gpu_layers(mut self, gpu_layers: u32) -> Self {
        self.gpu_layers = gpu_layers;
        self
    }
}

/// Engine running llama.cpp on its worker thread, offloading `gpu_layers`
pub fn spawn_llama_engine(gpu_layers: u32) -> Result<NativeEngine, EngineError> {
    NativeEngine::spawn(move || Ok(LlamaCppBackend::init()?.with_gpu_layers(gpu_layers)))
}

impl InferenceBackend for LlamaCppBackend {
    fn load(&mut self, path: &Path, config: &ModelConfig) -> Result<ModelInfo, EngineError> {
        self.unload();

        let model_params = LlamaModelParams::default().with_n_gpu_layers(self.gpu_layers);
        let model = LlamaModel::load_from_file(&self.backend, path, &model_params)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

        let info = ModelInfo {
            path: path.to_string_lossy().to_string(),
            size_bytes: model.size() as u64,
            vocab_size: model.n_vocab(),
            context_length: model.n_ctx_train(),
            parameters: Some(model.n_params() as u64),
        };

        tracing::info!(
            "Model info extracted: {} ({} params, {} vocab, {} ctx)",
            info.path,
            model.n_params(),
            info.vocab_size,
            info.context_length
        );

        self.model = Some(model);
        self.config = Some(config.clone());
        Ok(info)
    }

    fn generate(
        &mut self,
        request: &GenerationRequest,
        stop: &AtomicBool,
        emit: &mut dyn FnMut(String) -> ControlFlow<()>,
    ) -> Result<FinishReason, EngineError> {
        let (model, config) = match (&self.model, &self.config) {
            (Some(model), Some(config)) => (model, config),
            _ => return Err(EngineError::NoModelLoaded),
        };

        let n_ctx = config.context_size.min(model.n_ctx_train()).max(512);
        let max_tokens = request.max_tokens.min(n_ctx / 2);
        let tokens = fit_prompt(model, request, config.smart_context, n_ctx - max_tokens)?;

        tracing::debug!("Tokenized prompt into {} tokens", tokens.len());

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(n_ctx))
            .with_n_batch(config.batch_size)
            .with_n_threads(config.threads as i32)
            .with_n_threads_batch(config.threads as i32);

        let mut ctx = model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| EngineError::ContextCreate(e.to_string()))?;

        run_inference(
            &mut ctx,
            model,
            &tokens,
            config.batch_size as usize,
            max_tokens,
            &request.sampling,
            stop,
            emit,
        )
    }

    fn unload(&mut self) {
        if self.model.take().is_some() {
            tracing::info!("Model weights released");
        }
        self.config = None;
    }
}

/// Tokenize the request, dropping the oldest turn pairs while it overflows
/// `budget` (smart context) or failing with `ContextOverflow`.
fn fit_prompt(
    model: &LlamaModel,
    request: &GenerationRequest,
    smart_context: bool,
    budget: u32,
) -> Result<Vec<LlamaToken>, EngineError> {
    let mut turns: &[Turn] = &request.turns;

    loop {
        let prompt = render_prompt(model, &request.system_prompt, turns);
        let tokens = model
            .str_to_token(&prompt, AddBos::Always)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;

        if tokens.len() <= budget as usize {
            return Ok(tokens);
        }
        if !smart_context || turns.len() <= 1 {
            return Err(EngineError::ContextOverflow {
                prompt_tokens: tokens.len(),
                window: budget,
            });
        }

        let evict = if turns.len() > 2 { 2 } else { 1 };
        tracing::debug!(
            "Prompt is {} tokens over a {} budget, dropping {} oldest turns",
            tokens.len(),
            budget,
            evict
        );
        turns = &turns[evict..];
    }
}

fn render_prompt(model: &LlamaModel, system_prompt: &str, turns: &[Turn]) -> String {
    match apply_chat_template(model, system_prompt, turns) {
        Ok(prompt) => prompt,
        Err(error) => {
            tracing::warn!("Chat template not applied: {error}");
            plain_prompt(system_prompt, turns)
        }
    }
}

fn apply_chat_template(model: &LlamaModel, system_prompt: &str, turns: &[Turn]) -> Result<String, String> {
    let template = model
        .chat_template(None)
        .map_err(|e| format!("Failed to load chat template: {e}"))?;

    let mut messages = Vec::with_capacity(turns.len() + 1);
    if !system_prompt.is_empty() {
        messages.push(
            LlamaChatMessage::new(Role::System.as_str().to_string(), system_prompt.to_string())
                .map_err(|e| format!("Failed to build chat message: {e}"))?,
        );
    }
    for turn in turns {
        messages.push(
            LlamaChatMessage::new(turn.role.as_str().to_string(), turn.content.clone())
                .map_err(|e| format!("Failed to build chat message: {e}"))?,
        );
    }

    model
        .apply_chat_template(&template, &messages, true)
        .map_err(|e| format!("Failed to apply chat template: {e}"))
}

/// Fallback rendering for models without a chat template
fn plain_prompt(system_prompt: &str, turns: &[Turn]) -> String {
    let mut prompt = String::new();
    if !system_prompt.is_empty() {
        prompt.push_str(system_prompt);
        prompt.push_str("\n\n");
    }
    for turn in turns {
        let speaker = match turn.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        };
        prompt.push_str(speaker);
        prompt.push_str(": ");
        prompt.push_str(&turn.content);
        prompt.push('\n');
    }
    prompt.push_str("Assistant:");
    prompt
}

/// Runs the inference loop
fn run_inference(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    prompt_tokens: &[LlamaToken],
    n_batch: usize,
    max_tokens: u32,
    sampling: &SamplingParams,
    stop: &AtomicBool,
    emit: &mut dyn FnMut(String) -> ControlFlow<()>,
) -> Result<FinishReason, EngineError> {
    let n_batch = n_batch.max(1);
    let mut batch = LlamaBatch::new(n_batch, 1);

    // Process the prompt in batch-sized chunks; logits only for the last token
    let last_index = prompt_tokens.len().saturating_sub(1);
    for (chunk_index, chunk) in prompt_tokens.chunks(n_batch).enumerate() {
        batch.clear();
        for (offset, token) in chunk.iter().enumerate() {
            let pos = chunk_index * n_batch + offset;
            batch
                .add(*token, pos as i32, &[0], pos == last_index)
                .map_err(|e| EngineError::Inference(format!("Failed to add token to batch: {}", e)))?;
        }
        ctx.decode(&mut batch).map_err(decode_error)?;
        if stop.load(Ordering::SeqCst) {
            return Ok(FinishReason::Cancelled);
        }
    }

    let seed = if sampling.seed == 0 {
        rand_seed()
    } else {
        sampling.seed
    };

    let mut sampler = if sampling.temperature < 0.01 {
        // Use greedy sampling for very low temperature
        LlamaSampler::greedy()
    } else {
        LlamaSampler::chain_simple([
            LlamaSampler::top_k(sampling.top_k as i32),
            LlamaSampler::top_p(sampling.top_p, 1),
            LlamaSampler::temp(sampling.temperature),
            LlamaSampler::dist(seed),
        ])
    };

    let mut n_decoded = prompt_tokens.len() as i32;

    // Buffer for handling incomplete UTF-8 sequences
    let mut utf8_buffer: Vec<u8> = Vec::new();

    for _ in 0..max_tokens {
        // Checked every step: a token may complete no fragment
        if stop.load(Ordering::SeqCst) {
            tracing::debug!("Generation stopped by user");
            return Ok(FinishReason::Cancelled);
        }

        let new_token = sampler.sample(ctx, batch.n_tokens() - 1);
        sampler.accept(new_token);

        if model.is_eog_token(new_token) {
            tracing::debug!("End of generation token encountered");
            if let Some(rest) = flush_utf8(&mut utf8_buffer) {
                let _ = emit(rest);
            }
            return Ok(FinishReason::EndOfSequence);
        }

        let token_bytes = model
            .token_to_bytes(new_token, Special::Tokenize)
            .map_err(|e| EngineError::Inference(format!("Failed to convert token to bytes: {}", e)))?;
        utf8_buffer.extend_from_slice(&token_bytes);

        if let Some(fragment) = take_valid_utf8(&mut utf8_buffer) {
            if emit(fragment).is_break() {
                return Ok(FinishReason::Cancelled);
            }
        }

        // Prepare batch for next iteration
        batch.clear();
        batch
            .add(new_token, n_decoded, &[0], true)
            .map_err(|e| EngineError::Inference(format!("Failed to add token to batch: {}", e)))?;
        ctx.decode(&mut batch).map_err(decode_error)?;

        n_decoded += 1;
    }

    if let Some(rest) = flush_utf8(&mut utf8_buffer) {
        let _ = emit(rest);
    }
    Ok(FinishReason::MaxTokens)
}

/// A negative llama_decode status leaves the context unusable
fn decode_error(e: DecodeError) -> EngineError {
    match e {
        DecodeError::Unknown(code) if code < 0 => {
            EngineError::Corrupted(format!("llama_decode returned {}", code))
        }
        other => EngineError::Inference(format!("Failed to decode: {}", other)),
    }
}

/// Decode the buffer up to an incomplete trailing sequence, which is kept
///
/// Bytes that can never start valid UTF-8 (byte-fallback tokens) become
/// U+FFFD instead of blocking everything after them.
fn take_valid_utf8(buffer: &mut Vec<u8>) -> Option<String> {
    let mut text = String::new();
    let mut rest: &[u8] = &buffer[..];
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                text.push_str(valid);
                rest = &[];
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                text.push_str(&String::from_utf8_lossy(valid));
                match e.error_len() {
                    Some(invalid) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[invalid..];
                    }
                    None => {
                        rest = after;
                        break;
                    }
                }
            }
        }
    }

    let tail = rest.to_vec();
    *buffer = tail;
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Whatever is left at the end, lossily decoded
fn flush_utf8(buffer: &mut Vec<u8>) -> Option<String> {
    if buffer.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(buffer).into_owned();
    buffer.clear();
    Some(text)
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_valid_utf8_keeps_partial_sequence() {
        // "é" is 0xC3 0xA9
        let mut buffer = vec![b'c', b'a', b'f', 0xC3];
        assert_eq!(take_valid_utf8(&mut buffer).as_deref(), Some("caf"));
        assert_eq!(buffer, vec![0xC3]);

        assert_eq!(take_valid_utf8(&mut buffer), None);
        buffer.push(0xA9);
        assert_eq!(take_valid_utf8(&mut buffer).as_deref(), Some("é"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_invalid_byte_does_not_block_later_text() {
        let mut buffer = vec![0xFF];
        buffer.extend_from_slice(b"Hello");
        assert_eq!(take_valid_utf8(&mut buffer).as_deref(), Some("\u{fffd}Hello"));
        assert!(buffer.is_empty());

        buffer.extend_from_slice(b" world");
        assert_eq!(take_valid_utf8(&mut buffer).as_deref(), Some(" world"));

        // Invalid byte in the middle, incomplete sequence at the end
        let mut buffer = vec![b'a', 0xC0, b'b', 0xE2, 0x82];
        assert_eq!(take_valid_utf8(&mut buffer).as_deref(), Some("a\u{fffd}b"));
        assert_eq!(buffer, vec![0xE2, 0x82]);
        buffer.push(0xAC);
        assert_eq!(take_valid_utf8(&mut buffer).as_deref(), Some("€"));
    }

    #[test]
    fn test_flush_utf8() {
        let mut buffer = vec![b'o', b'k', 0xC3];
        let text = flush_utf8(&mut buffer).unwrap();
        assert!(text.starts_with("ok"));
        assert!(buffer.is_empty());
        assert_eq!(flush_utf8(&mut buffer), None);
    }

    #[test]
    fn test_plain_prompt() {
        let turns = vec![Turn::user("hi"), Turn::assistant("hello"), Turn::user("bye")];
        let prompt = plain_prompt("Be brief.", &turns);
        assert_eq!(
            prompt,
            "Be brief.\n\nUser: hi\nAssistant: hello\nUser: bye\nAssistant:"
        );
    }
}
