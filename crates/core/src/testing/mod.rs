//! Shared test utilities for vlfuse-core.
//!
//! Mock vision encoder and decoder plus tiny configurations small enough to
//! run the whole fusion path on CPU with `VarBuilder::zeros` weights.

mod mock_model;
mod tiny_config;

pub use mock_model::{MockEmbeddingDecoder, MockVisionEncoder};
pub use tiny_config::{
    tiny_fusion_config, tiny_video_llava_config, TINY_FEATURE_H, TINY_FEATURE_W, TINY_LLM_HIDDEN,
    TINY_SLOT_COUNT, TINY_VISION_HIDDEN, TINY_VOCAB_SIZE,
};
