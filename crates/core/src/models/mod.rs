//! Model wiring for multimodal checkpoints.

pub mod video_llava_qwen;

pub use video_llava_qwen::{EmbeddingDecoder, VideoLlavaQwenConfig, VideoLlavaQwenForCausalLM};

use crate::config::ModelConfig;

/// Architectures served by [`VideoLlavaQwenForCausalLM`].
pub const VIDEO_LLAVA_QWEN_ARCHITECTURES: &[&str] = &["VideoLlavaQwenForCausalLM"];

/// Whether `cfg` names an architecture this crate can wire.
pub fn is_supported(cfg: &ModelConfig) -> bool {
    cfg.architectures
        .first()
        .is_some_and(|arch| VIDEO_LLAVA_QWEN_ARCHITECTURES.contains(&arch.as_str()))
        || cfg.model_type.as_deref() == Some("video_llava_qwen")
}
