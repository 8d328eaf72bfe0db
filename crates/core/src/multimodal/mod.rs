//! Multimodal support for spatiotemporal vision-language models.
//!
//! Image inputs reach the language model through four stages:
//! 1. Locate the image placeholders in the tokenized prompt and expand each
//!    one into a block of sentinel slots ([`placeholder`])
//! 2. Encode the image with the vision tower and pick the configured layers
//!    ([`VisionTower`])
//! 3. Downsample, select and project the patch features into exactly one
//!    token per slot ([`SpatiotemporalProjector`])
//! 4. Splice the projected tokens into the lexical embeddings of the whole
//!    batch ([`assemble_batch`])
//!
//! # Example
//!
//! ```ignore
//! use vlfuse_core::multimodal::{ForwardMode, ImageInput, MultimodalFusion, MultimodalRequest};
//!
//! let fusion = MultimodalFusion::new(cfg, Some(vocab_size), vb.pp("mm_projector"))?;
//! let request = MultimodalRequest::with_images(token_ids, vec![ImageInput::PixelValues(pixels)]);
//! let prepared = fusion.prepare_request(&tower, &request)?;
//! let embeds = fusion.embed(ForwardMode::Prefill, &[prepared], &embed_tokens)?;
//! ```

mod assembler;
mod error;
mod fusion;
mod inputs;
pub mod placeholder;
mod processor;
mod projector;
pub mod selector;
mod spatiotemporal;
mod vision;

pub use assembler::{assemble_batch, SpliceRequest};
pub use error::{FusionError, Result};
pub use fusion::{FusionConfig, ForwardMode, MultimodalFusion, TokenEmbedder};
pub use inputs::{ImageInput, MultimodalRequest, PreparedRequest};
pub use placeholder::{
    expand_placeholders, insert_image_tokens, locate_placeholders, ExpandedPrompt, ImageSlotBlock,
    PlaceholderConfig, PlaceholderSite, DEFAULT_IMAGE_TOKEN_ID, DEFAULT_SENTINEL_TOKEN_ID,
    DEFAULT_SLOT_COUNT,
};
pub use processor::{MultimodalWorkerPool, PreparationContext, WorkerPoolConfig};
pub use projector::{MultimodalProjector, ProjectorConfig, ProjectorType, SpatiotemporalProjector};
pub use selector::GlobalLocalSelector;
pub use spatiotemporal::{SelectorConfig, SpatiotemporalDownsampler};
pub use vision::{LayerSelection, VisionEncoder, VisionTower};
