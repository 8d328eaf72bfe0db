//! Video-LLaVA on a Qwen2 decoder with the spatiotemporal feature selector.
//!
//! Architecture:
//! - Vision tower (external encoder) with a configured layer selection
//! - `mm_projector`: spatiotemporal downsampler + two-layer MLP
//! - Qwen2 decoder (external), driven through input embeddings
//!
//! Each image placeholder expands to `num_image_tokens` slots (361 for one
//! frame: class token plus a 12x30 grid). Prefill splices the projected image
//! tokens into the lexical embeddings; decode is purely lexical.

use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use tracing::info;

use crate::config::ModelConfig;
use crate::multimodal::{
    insert_image_tokens, FusionConfig, FusionError, ForwardMode, ImageInput, LayerSelection,
    MultimodalFusion, MultimodalRequest, MultimodalWorkerPool, PlaceholderConfig,
    PreparationContext, PreparedRequest, ProjectorConfig, ProjectorType, Result, SelectorConfig,
    TokenEmbedder, VisionEncoder, VisionTower, WorkerPoolConfig,
};

const DEFAULT_MM_HIDDEN_SIZE: usize = 1152;
const DEFAULT_PROJECTOR_TYPE: &str = "st_cdpnet_gl_feature_selector";
const STANDARD_CONV_PROJECTOR_TYPE: &str = "st_cdpnet_standard_conv";
const DEFAULT_IMAGE_TOKEN_INDEX: i64 = -200;
const DEFAULT_SENTINEL_TOKEN_INDEX: i64 = -201;
const DEFAULT_DENSE_CONNECTOR_LAYERS: usize = 24;

/// Language-model half of the composition.
pub trait EmbeddingDecoder: TokenEmbedder {
    /// Run the decoder on packed input embeddings `[sum(seq_lens), hidden]`.
    fn forward_embeds(
        &self,
        input_embeds: &Tensor,
        seq_lens: &[usize],
        mode: ForwardMode,
    ) -> candle_core::Result<Tensor>;
}

/// Typed model configuration parsed from the HF config.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoLlavaQwenConfig {
    pub llm_hidden_size: usize,
    pub vocab_size: usize,
    /// BOS kept once at the front when prompt chunks are joined.
    pub bos_token_id: Option<u32>,
    pub layer_selection: LayerSelection,
    pub fusion: FusionConfig,
}

/// Map an HF token index (negative values are reserved ids) to a u32 id.
fn reserved_token_id(key: &str, value: i64) -> Result<u32> {
    if value < 0 {
        i32::try_from(value)
            .map(|v| v as u32)
            .map_err(|_| FusionError::InvalidConfig(format!("{key} {value} out of range")))
    } else {
        u32::try_from(value)
            .map_err(|_| FusionError::InvalidConfig(format!("{key} {value} out of range")))
    }
}

impl VideoLlavaQwenConfig {
    pub fn from_model_config(cfg: &ModelConfig) -> Result<Self> {
        let projector_name = cfg
            .extra_str("mm_projector_type")
            .unwrap_or(DEFAULT_PROJECTOR_TYPE);
        let projector_type = ProjectorType::from_hf_name(projector_name).ok_or_else(|| {
            FusionError::InvalidConfig(format!("unsupported mm_projector_type {projector_name}"))
        })?;

        let defaults = SelectorConfig::default();
        let selector = SelectorConfig {
            feature_h: cfg.extra_usize("feature_h").unwrap_or(defaults.feature_h),
            feature_w: cfg.extra_usize("feature_w").unwrap_or(defaults.feature_w),
            final_h: cfg.extra_usize("final_h").unwrap_or(defaults.final_h),
            final_w: cfg.extra_usize("final_w").unwrap_or(defaults.final_w),
            extend_token_num: cfg
                .extra_usize("extend_token_num")
                .unwrap_or(defaults.extend_token_num),
            num_frames: cfg.extra_usize("num_frames").unwrap_or(defaults.num_frames),
            temporal_kernel: cfg
                .extra_usize("temporal_kernel")
                .unwrap_or(defaults.temporal_kernel),
            class_token: cfg.extra_bool("class_token").unwrap_or(defaults.class_token),
            peg_standard_conv: projector_name == STANDARD_CONV_PROJECTOR_TYPE,
            use_post_norm: cfg.extra_bool("use_post_norm").unwrap_or(defaults.use_post_norm),
            post_norm_eps: defaults.post_norm_eps,
        };

        let image_token_id = reserved_token_id(
            "image_token_index",
            cfg.extra_i64("image_token_index")
                .unwrap_or(DEFAULT_IMAGE_TOKEN_INDEX),
        )?;
        let sentinel_id = reserved_token_id(
            "expansion_sentinel_index",
            cfg.extra_i64("expansion_sentinel_index")
                .unwrap_or(DEFAULT_SENTINEL_TOKEN_INDEX),
        )?;
        let placeholder = PlaceholderConfig {
            image_token_id,
            sentinel_id,
            slot_count: cfg
                .extra_usize("num_image_tokens")
                .unwrap_or_else(|| selector.output_len()),
            keep_placeholder: cfg.extra_bool("add_special_token").unwrap_or(false),
            pad_token_id: cfg.pad_token_id.unwrap_or(0),
        };

        let vision_hidden_size = cfg
            .extra_usize("mm_hidden_size")
            .unwrap_or(DEFAULT_MM_HIDDEN_SIZE);
        let projector = ProjectorConfig {
            projector_type,
            vision_hidden_size,
            llm_hidden_size: cfg.hidden_size,
        };

        let compound = cfg.extra_usize("mm_vision_select_compound_layer");
        let layer_selection = if cfg.extra_bool("mm_dense_connector").unwrap_or(false) {
            LayerSelection::DenseConnector {
                last: compound.unwrap_or(DEFAULT_DENSE_CONNECTOR_LAYERS),
            }
        } else if let Some(last) = compound {
            LayerSelection::CompoundMean { last }
        } else {
            LayerSelection::Single {
                layer: cfg.extra_i64("mm_vision_select_layer").unwrap_or(-1) as isize,
            }
        };

        let parsed = Self {
            llm_hidden_size: cfg.hidden_size,
            vocab_size: cfg.vocab_size,
            bos_token_id: cfg.bos_token_id,
            layer_selection,
            fusion: FusionConfig {
                placeholder,
                selector,
                projector,
            },
        };
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<()> {
        self.layer_selection.validate()?;
        self.fusion.validate(Some(self.vocab_size))
    }

    /// Join prompt chunks tokenized around each image marker, one placeholder
    /// per gap.
    pub fn join_prompt_chunks(&self, chunks: &[Vec<u32>]) -> Vec<u32> {
        insert_image_tokens(
            chunks,
            self.fusion.placeholder.image_token_id,
            self.bos_token_id,
        )
    }
}

/// Vision tower + fusion + decoder.
pub struct VideoLlavaQwenForCausalLM<V, D> {
    cfg: VideoLlavaQwenConfig,
    ctx: Arc<PreparationContext<V>>,
    decoder: D,
}

impl<V: VisionEncoder + 'static, D: EmbeddingDecoder> VideoLlavaQwenForCausalLM<V, D> {
    /// Load the projector from `vb` (checkpoint root) and wire the parts.
    pub fn new(cfg: &VideoLlavaQwenConfig, encoder: V, decoder: D, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let tower = VisionTower::new(encoder, cfg.layer_selection)?;
        if tower.output_channels() != cfg.fusion.projector.vision_hidden_size {
            return Err(FusionError::InvalidConfig(format!(
                "vision tower yields width {}, mm_hidden_size is {}",
                tower.output_channels(),
                cfg.fusion.projector.vision_hidden_size
            )));
        }
        let fusion = MultimodalFusion::new(
            cfg.fusion.clone(),
            Some(cfg.vocab_size),
            vb.pp("model").pp("mm_projector"),
        )?;
        info!(
            layer_selection = ?cfg.layer_selection,
            num_frames = cfg.fusion.selector.num_frames,
            "Loaded VideoLlavaQwen multimodal components"
        );
        Ok(Self {
            cfg: cfg.clone(),
            ctx: Arc::new(PreparationContext { fusion, tower }),
            decoder,
        })
    }

    pub fn from_model_config(cfg: &ModelConfig, encoder: V, decoder: D, vb: VarBuilder) -> Result<Self> {
        let parsed = VideoLlavaQwenConfig::from_model_config(cfg)?;
        Self::new(&parsed, encoder, decoder, vb)
    }

    pub fn config(&self) -> &VideoLlavaQwenConfig {
        &self.cfg
    }

    pub fn fusion(&self) -> &MultimodalFusion {
        &self.ctx.fusion
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    /// Pool sharing this model's vision tower and projector.
    pub fn worker_pool(&self, cfg: WorkerPoolConfig) -> Result<MultimodalWorkerPool<V>> {
        MultimodalWorkerPool::from_shared(self.ctx.clone(), cfg)
    }

    /// Join `chunks` into one prompt and prepare it with `images`, in order.
    pub fn prepare_chunks(
        &self,
        chunks: &[Vec<u32>],
        images: Vec<ImageInput>,
    ) -> Result<PreparedRequest> {
        let token_ids = self.cfg.join_prompt_chunks(chunks);
        self.prepare(&MultimodalRequest::with_images(token_ids, images))
    }

    /// Synchronous preparation of one request.
    pub fn prepare(&self, request: &MultimodalRequest) -> Result<PreparedRequest> {
        self.ctx.fusion.prepare_request(&self.ctx.tower, request)
    }

    /// Embed the batch (fusing images on prefill) and run the decoder.
    pub fn forward(&self, mode: ForwardMode, batch: &[PreparedRequest]) -> Result<Tensor> {
        let embeds = self.ctx.fusion.embed(mode, batch, &self.decoder)?;
        let seq_lens: Vec<usize> = batch.iter().map(PreparedRequest::seq_len).collect();
        Ok(self.decoder.forward_embeds(&embeds, &seq_lens, mode)?)
    }
}
