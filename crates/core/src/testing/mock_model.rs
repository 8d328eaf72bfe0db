use candle_core::{DType, Device, Tensor};
use candle_nn::Embedding;

use super::tiny_config::{
    TINY_FEATURE_H, TINY_FEATURE_W, TINY_LLM_HIDDEN, TINY_VISION_HIDDEN, TINY_VOCAB_SIZE,
};
use crate::models::EmbeddingDecoder;
use crate::multimodal::{ForwardMode, LayerSelection, TokenEmbedder, VisionEncoder, VisionTower};

/// A mock vision encoder returning constant hidden states of the tiny grid.
///
/// Layer `i` is filled with `i + 1`; every frame carries a class token.
pub struct MockVisionEncoder {
    hidden_size: usize,
    num_layers: usize,
    tokens_per_frame: usize,
}

impl MockVisionEncoder {
    pub fn new() -> Self {
        Self {
            hidden_size: TINY_VISION_HIDDEN,
            num_layers: 2,
            tokens_per_frame: 1 + TINY_FEATURE_H * TINY_FEATURE_W,
        }
    }

    /// Tower selecting the last layer.
    pub fn tower() -> VisionTower<Self> {
        VisionTower::new(Self::new(), LayerSelection::Single { layer: -1 })
            .expect("single-layer selection is always valid")
    }
}

impl Default for MockVisionEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VisionEncoder for MockVisionEncoder {
    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn hidden_states(&self, pixel_values: &Tensor) -> candle_core::Result<Vec<Tensor>> {
        let frames = pixel_values.dim(0)?;
        (0..self.num_layers)
            .map(|i| {
                Tensor::full(
                    (i + 1) as f32,
                    (frames, self.tokens_per_frame, self.hidden_size),
                    pixel_values.device(),
                )
            })
            .collect()
    }
}

/// A mock decoder whose "hidden states" are its input embeddings.
///
/// Embedding row `i` is filled with `i`.
pub struct MockEmbeddingDecoder {
    embedding: Embedding,
}

impl MockEmbeddingDecoder {
    pub fn new(vocab_size: usize, hidden_size: usize) -> Self {
        Self::with_device(vocab_size, hidden_size, &Device::Cpu)
    }

    pub fn with_device(vocab_size: usize, hidden_size: usize, device: &Device) -> Self {
        let table = Tensor::arange(0u32, vocab_size as u32, device)
            .and_then(|ids| ids.to_dtype(DType::F32))
            .and_then(|ids| ids.unsqueeze(1))
            .and_then(|ids| ids.broadcast_as((vocab_size, hidden_size)))
            .and_then(|t| t.contiguous())
            .expect("mock embedding table");
        Self {
            embedding: Embedding::new(table, hidden_size),
        }
    }

    pub fn tiny() -> Self {
        Self::new(TINY_VOCAB_SIZE, TINY_LLM_HIDDEN)
    }
}

impl TokenEmbedder for MockEmbeddingDecoder {
    fn embed_tokens(&self, ids: &Tensor) -> candle_core::Result<Tensor> {
        self.embedding.embed_tokens(ids)
    }

    fn device(&self) -> &Device {
        TokenEmbedder::device(&self.embedding)
    }
}

impl EmbeddingDecoder for MockEmbeddingDecoder {
    fn forward_embeds(
        &self,
        input_embeds: &Tensor,
        _seq_lens: &[usize],
        _mode: ForwardMode,
    ) -> candle_core::Result<Tensor> {
        Ok(input_embeds.clone())
    }
}
