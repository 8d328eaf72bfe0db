use crate::models::VideoLlavaQwenConfig;
use crate::multimodal::{
    FusionConfig, LayerSelection, PlaceholderConfig, ProjectorConfig, SelectorConfig,
    DEFAULT_IMAGE_TOKEN_ID, DEFAULT_SENTINEL_TOKEN_ID,
};

pub const TINY_VISION_HIDDEN: usize = 8;
pub const TINY_LLM_HIDDEN: usize = 16;
pub const TINY_VOCAB_SIZE: usize = 64;
pub const TINY_FEATURE_H: usize = 8;
pub const TINY_FEATURE_W: usize = 12;
/// Class token plus the 2x3 target grid.
pub const TINY_SLOT_COUNT: usize = 7;

/// Single-frame fusion config: 8x12 patches, conv to 4x6, resize to 2x3, K = 3.
pub fn tiny_fusion_config(image_token_id: u32, sentinel_id: u32) -> FusionConfig {
    FusionConfig {
        placeholder: PlaceholderConfig {
            image_token_id,
            sentinel_id,
            slot_count: TINY_SLOT_COUNT,
            keep_placeholder: false,
            pad_token_id: 0,
        },
        selector: SelectorConfig {
            feature_h: TINY_FEATURE_H,
            feature_w: TINY_FEATURE_W,
            final_h: 2,
            final_w: 3,
            extend_token_num: 3,
            ..SelectorConfig::default()
        },
        projector: ProjectorConfig::mlp(TINY_VISION_HIDDEN, TINY_LLM_HIDDEN),
    }
}

/// Model config around [`tiny_fusion_config`] with reserved ids outside the vocabulary.
pub fn tiny_video_llava_config() -> VideoLlavaQwenConfig {
    VideoLlavaQwenConfig {
        llm_hidden_size: TINY_LLM_HIDDEN,
        vocab_size: TINY_VOCAB_SIZE,
        bos_token_id: Some(1),
        layer_selection: LayerSelection::Single { layer: -1 },
        fusion: tiny_fusion_config(DEFAULT_IMAGE_TOKEN_ID, DEFAULT_SENTINEL_TOKEN_ID),
    }
}
