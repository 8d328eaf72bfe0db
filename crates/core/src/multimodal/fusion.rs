//! Fusion of visual tokens into the language model's input embeddings.
//!
//! [`MultimodalFusion`] owns everything between the vision tower and the
//! decoder: placeholder expansion, the spatiotemporal projector and the
//! batched splice of image features into lexical embeddings.

use candle_core::{Device, Module, Tensor};
use candle_nn::{Embedding, VarBuilder};
use tracing::{debug, info};

use super::assembler::assemble_batch;
use super::error::{FusionError, Result};
use super::inputs::{ImageInput, MultimodalRequest, PreparedRequest};
use super::placeholder::{self, ExpandedPrompt, PlaceholderConfig};
use super::projector::{ProjectorConfig, SpatiotemporalProjector};
use super::spatiotemporal::SelectorConfig;
use super::vision::{VisionEncoder, VisionTower};

/// Phase of the forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Full prompt; image features are spliced in.
    Prefill,
    /// One new token per sequence; purely lexical.
    Decode,
}

/// Lexical token embedding lookup.
pub trait TokenEmbedder {
    /// `[len]` u32 ids -> `[len, hidden]`.
    fn embed_tokens(&self, ids: &Tensor) -> candle_core::Result<Tensor>;

    fn device(&self) -> &Device;
}

impl TokenEmbedder for Embedding {
    fn embed_tokens(&self, ids: &Tensor) -> candle_core::Result<Tensor> {
        self.forward(ids)
    }

    fn device(&self) -> &Device {
        self.embeddings().device()
    }
}

/// Configuration of the whole fusion path.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionConfig {
    pub placeholder: PlaceholderConfig,
    pub selector: SelectorConfig,
    pub projector: ProjectorConfig,
}

impl FusionConfig {
    /// Validate every part plus the slot count against the selector output.
    pub fn validate(&self, vocab_size: Option<usize>) -> Result<()> {
        self.placeholder.validate(vocab_size)?;
        self.selector.validate()?;
        let fused = self.selector.output_len();
        if self.placeholder.slot_count != fused {
            return Err(FusionError::InvalidSelectorConfig(format!(
                "slot_count {} does not match the {} tokens selected for {} frame(s)",
                self.placeholder.slot_count, fused, self.selector.num_frames
            )));
        }
        Ok(())
    }
}

/// Placeholder expansion, visual token selection/projection and splicing.
pub struct MultimodalFusion {
    cfg: FusionConfig,
    projector: SpatiotemporalProjector,
}

impl MultimodalFusion {
    /// Build from `vb` rooted at the projector weights (`mm_projector`).
    pub fn new(cfg: FusionConfig, vocab_size: Option<usize>, vb: VarBuilder) -> Result<Self> {
        cfg.validate(vocab_size)?;
        let projector = SpatiotemporalProjector::new(&cfg.selector, &cfg.projector, vb)?;
        info!(
            slot_count = cfg.placeholder.slot_count,
            keep_placeholder = cfg.placeholder.keep_placeholder,
            vision_hidden = cfg.projector.vision_hidden_size,
            llm_hidden = cfg.projector.llm_hidden_size,
            "Multimodal fusion ready"
        );
        Ok(Self { cfg, projector })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.cfg
    }

    pub fn slot_count(&self) -> usize {
        self.cfg.placeholder.slot_count
    }

    pub fn sentinel_id(&self) -> u32 {
        self.cfg.placeholder.sentinel_id
    }

    /// Locate the placeholders of `num_images` images and expand them.
    pub fn expand_placeholders(&self, token_ids: &[u32], num_images: usize) -> Result<ExpandedPrompt> {
        let sites = placeholder::locate_placeholders(
            token_ids,
            self.cfg.placeholder.image_token_id,
            num_images,
        )?;
        placeholder::expand_placeholders(token_ids, &sites, &self.cfg.placeholder)
    }

    /// Patch features `[t, n, c]` -> projected image slots `[slot_count, llm_hidden]`.
    pub fn select_and_project(&self, features: &Tensor) -> Result<Tensor> {
        let projected = self.projector.forward(features)?;
        let rows = projected.dim(0)?;
        if rows != self.slot_count() {
            return Err(FusionError::IncompatibleFeatureShape(format!(
                "selector produced {rows} tokens for {} configured slots",
                self.slot_count()
            )));
        }
        Ok(projected)
    }

    /// Run the vision tower, then select and project.
    pub fn encode_image<V: VisionEncoder>(
        &self,
        tower: &VisionTower<V>,
        pixel_values: &Tensor,
    ) -> Result<Tensor> {
        let expected = self.cfg.projector.vision_hidden_size;
        if tower.output_channels() != expected {
            return Err(FusionError::InvalidConfig(format!(
                "vision tower yields width {}, projector expects {expected}",
                tower.output_channels()
            )));
        }
        let features = tower.encode(pixel_values)?;
        self.select_and_project(&features)
    }

    /// Expand and encode one request; any failing image fails the request.
    pub fn prepare_request<V: VisionEncoder>(
        &self,
        tower: &VisionTower<V>,
        request: &MultimodalRequest,
    ) -> Result<PreparedRequest> {
        let expanded = self.expand_placeholders(&request.token_ids, request.images.len())?;
        let image_features = request
            .images
            .iter()
            .map(|image| match image {
                ImageInput::PixelValues(pixels) => self.encode_image(tower, pixels),
                ImageInput::PatchFeatures(features) => self.select_and_project(features),
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(
            prompt_len = request.token_ids.len(),
            expanded_len = expanded.token_ids.len(),
            num_images = image_features.len(),
            "Prepared multimodal request"
        );
        Ok(PreparedRequest {
            expanded,
            image_features,
        })
    }

    /// Lexical embeddings of one expanded prompt; reserved ids look up the pad id.
    fn lexical_embeddings<E: TokenEmbedder + ?Sized>(
        &self,
        expanded: &ExpandedPrompt,
        embedder: &E,
    ) -> Result<Tensor> {
        let ids = expanded.lexical_ids_for(&self.cfg.placeholder);
        let len = ids.len();
        let ids = Tensor::from_vec(ids, len, embedder.device())?;
        Ok(embedder.embed_tokens(&ids)?)
    }

    /// Input embeddings `[sum(seq_len), hidden]` for a prefill batch.
    pub fn prepare_prefill_embeddings<E: TokenEmbedder + ?Sized>(
        &self,
        batch: &[PreparedRequest],
        embedder: &E,
    ) -> Result<Tensor> {
        let lexical = batch
            .iter()
            .map(|req| self.lexical_embeddings(&req.expanded, embedder))
            .collect::<Result<Vec<_>>>()?;
        let requests: Vec<_> = batch
            .iter()
            .zip(&lexical)
            .map(|(req, lex)| req.splice(lex))
            .collect();
        assemble_batch(&requests, self.sentinel_id())
    }

    /// Input embeddings for either phase. Decode ignores image features.
    pub fn embed<E: TokenEmbedder + ?Sized>(
        &self,
        mode: ForwardMode,
        batch: &[PreparedRequest],
        embedder: &E,
    ) -> Result<Tensor> {
        match mode {
            ForwardMode::Prefill => self.prepare_prefill_embeddings(batch, embedder),
            ForwardMode::Decode => {
                if batch.is_empty() {
                    return Err(FusionError::EmptyBatch);
                }
                let rows = batch
                    .iter()
                    .map(|req| self.lexical_embeddings(&req.expanded, embedder))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Tensor::cat(&rows, 0)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;
    use crate::multimodal::placeholder::DEFAULT_SLOT_COUNT;
    use crate::testing::{tiny_fusion_config, MockVisionEncoder, TINY_LLM_HIDDEN, TINY_SLOT_COUNT};

    const IMG: u32 = 500;
    const SENTINEL: u32 = 501;

    fn fusion() -> MultimodalFusion {
        let cfg = tiny_fusion_config(IMG, SENTINEL);
        MultimodalFusion::new(cfg, None, VarBuilder::zeros(DType::F32, &Device::Cpu)).unwrap()
    }

    /// Row `i` of the table is filled with `i`.
    fn embedder(vocab: usize) -> Embedding {
        let data: Vec<f32> = (0..vocab)
            .flat_map(|i| std::iter::repeat(i as f32).take(TINY_LLM_HIDDEN))
            .collect();
        let table = Tensor::from_vec(data, (vocab, TINY_LLM_HIDDEN), &Device::Cpu).unwrap();
        Embedding::new(table, TINY_LLM_HIDDEN)
    }

    #[test]
    fn test_default_config_is_consistent() {
        let cfg = FusionConfig {
            placeholder: PlaceholderConfig::default(),
            selector: SelectorConfig::default(),
            projector: ProjectorConfig::mlp(1152, 3584),
        };
        assert!(cfg.validate(Some(152_064)).is_ok());
        assert_eq!(cfg.placeholder.slot_count, DEFAULT_SLOT_COUNT);
    }

    #[test]
    fn test_slot_count_must_match_selector() {
        let mut cfg = tiny_fusion_config(IMG, SENTINEL);
        cfg.placeholder.slot_count += 1;
        assert!(matches!(
            cfg.validate(None),
            Err(FusionError::InvalidSelectorConfig(_))
        ));

        let mut cfg = tiny_fusion_config(IMG, SENTINEL);
        cfg.selector.num_frames = 2;
        assert!(cfg.validate(None).is_err());
        cfg.placeholder.slot_count = cfg.selector.output_len();
        assert!(cfg.validate(None).is_ok());
    }

    #[test]
    fn test_prepare_request_expands_and_projects() {
        let fusion = fusion();
        let tower = MockVisionEncoder::tower();
        let pixels = Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let request = MultimodalRequest::with_images(
            vec![1, IMG, 7],
            vec![ImageInput::PixelValues(pixels)],
        );

        let prepared = fusion.prepare_request(&tower, &request).unwrap();
        assert_eq!(prepared.seq_len(), 2 + TINY_SLOT_COUNT);
        assert_eq!(prepared.expanded.blocks[0].start, 1);
        assert_eq!(
            prepared.image_features[0].dims(),
            &[TINY_SLOT_COUNT, TINY_LLM_HIDDEN]
        );
    }

    #[test]
    fn test_prepare_request_is_all_or_nothing() {
        let fusion = fusion();
        let tower = MockVisionEncoder::tower();
        let good = Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let bad = Tensor::zeros((1, 10, 8), DType::F32, &Device::Cpu).unwrap();
        let request = MultimodalRequest::with_images(
            vec![IMG, 3, IMG],
            vec![ImageInput::PixelValues(good), ImageInput::PatchFeatures(bad)],
        );
        assert!(fusion.prepare_request(&tower, &request).is_err());

        let missing = MultimodalRequest::with_images(vec![IMG, IMG], vec![]);
        assert!(matches!(
            fusion.prepare_request(&tower, &missing),
            Err(FusionError::MalformedPlaceholders(_))
        ));
    }

    #[test]
    fn test_prefill_embeddings_splice_features() {
        let fusion = fusion();
        let tower = MockVisionEncoder::tower();
        let pixels = Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let with_image = fusion
            .prepare_request(
                &tower,
                &MultimodalRequest::with_images(vec![3, IMG, 4], vec![ImageInput::PixelValues(pixels)]),
            )
            .unwrap();
        let text = PreparedRequest::text_only(vec![5, 6]);

        let emb = embedder(16);
        let out = fusion
            .prepare_prefill_embeddings(&[with_image, text], &emb)
            .unwrap();
        assert_eq!(out.dims(), &[2 + TINY_SLOT_COUNT + 2, TINY_LLM_HIDDEN]);

        let col: Vec<f32> = out.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(col[0], 3.0);
        // zero projector weights yield zero image rows
        assert!(col[1..1 + TINY_SLOT_COUNT].iter().all(|&v| v == 0.0));
        assert_eq!(&col[1 + TINY_SLOT_COUNT..], &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_decode_is_lexical() {
        let fusion = fusion();
        let emb = embedder(16);
        let batch = [
            PreparedRequest::text_only(vec![9]),
            PreparedRequest::text_only(vec![2]),
        ];
        let out = fusion.embed(ForwardMode::Decode, &batch, &emb).unwrap();
        let col: Vec<f32> = out.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(col, vec![9.0, 2.0]);

        assert!(matches!(
            fusion.embed(ForwardMode::Decode, &[], &emb),
            Err(FusionError::EmptyBatch)
        ));
    }

    #[test]
    fn test_sentinel_rows_use_pad_lookup_before_splice() {
        let fusion = fusion();
        let expanded = fusion.expand_placeholders(&[IMG], 1).unwrap();
        let lex = fusion.lexical_embeddings(&expanded, &embedder(16)).unwrap();
        let col: Vec<f32> = lex.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(col.iter().all(|&v| v == 0.0));
        assert_eq!(col.len(), TINY_SLOT_COUNT);
    }
}
