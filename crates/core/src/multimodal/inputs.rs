//! Multimodal request types.

use candle_core::Tensor;

use super::assembler::SpliceRequest;
use super::placeholder::ExpandedPrompt;

/// One image (or multi-frame clip) attached to a request.
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// Preprocessed pixels, run through the vision tower.
    PixelValues(Tensor),
    /// Patch features `[t, n, c]` already produced by a vision encoder.
    PatchFeatures(Tensor),
}

impl ImageInput {
    pub fn tensor(&self) -> &Tensor {
        match self {
            Self::PixelValues(t) | Self::PatchFeatures(t) => t,
        }
    }
}

/// Tokenized prompt plus its images, in placeholder order.
#[derive(Debug, Clone)]
pub struct MultimodalRequest {
    pub token_ids: Vec<u32>,
    pub images: Vec<ImageInput>,
}

impl MultimodalRequest {
    pub fn text_only(token_ids: Vec<u32>) -> Self {
        Self {
            token_ids,
            images: Vec::new(),
        }
    }

    pub fn with_images(token_ids: Vec<u32>, images: Vec<ImageInput>) -> Self {
        Self { token_ids, images }
    }

    pub fn has_images(&self) -> bool {
        !self.images.is_empty()
    }
}

/// Expanded prompt with one projected feature tensor per image block.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub expanded: ExpandedPrompt,
    /// `[slot_count, llm_hidden]` per block, in block order.
    pub image_features: Vec<Tensor>,
}

impl PreparedRequest {
    pub fn text_only(token_ids: Vec<u32>) -> Self {
        Self {
            expanded: ExpandedPrompt::text_only(token_ids),
            image_features: Vec::new(),
        }
    }

    pub fn num_images(&self) -> usize {
        self.image_features.len()
    }

    pub fn seq_len(&self) -> usize {
        self.expanded.token_ids.len()
    }

    /// Borrow as an assembler request over the given lexical embeddings.
    pub fn splice<'a>(&'a self, lexical: &'a Tensor) -> SpliceRequest<'a> {
        SpliceRequest {
            token_ids: &self.expanded.token_ids,
            lexical,
            blocks: &self.expanded.blocks,
            features: &self.image_features,
        }
    }
}
