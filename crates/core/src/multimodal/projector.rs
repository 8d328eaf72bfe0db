//! Vision-language projectors.
//!
//! Projectors map selected visual tokens into the language model's hidden
//! space, one token at a time; token order and count are preserved.
//!
//! [`SpatiotemporalProjector`] chains the spatiotemporal downsampler in front
//! of the feed-forward projector, mirroring the checkpoint layout
//! `mm_projector.dwn.*` / `mm_projector.mlp.mlp.{0,2}.*`.
//!
//! # Example
//!
//! ```ignore
//! use vlfuse_core::multimodal::{ProjectorConfig, SpatiotemporalProjector};
//!
//! let projector = SpatiotemporalProjector::new(&selector_cfg, &projector_cfg, vb.pp("mm_projector"))?;
//! let llm_embeddings = projector.forward(&patch_features)?; // [N, llm_hidden]
//! ```

use candle_core::{Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use super::error::{FusionError, Result};
use super::spatiotemporal::{SelectorConfig, SpatiotemporalDownsampler};

/// Type of feed-forward projector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectorType {
    /// Single affine layer.
    Linear,
    /// Linear -> GELU -> Linear.
    Mlp,
}

impl ProjectorType {
    /// Map an HF `mm_projector_type` value.
    ///
    /// Every spatiotemporal projector variant ends in the two-layer MLP.
    pub fn from_hf_name(name: &str) -> Option<Self> {
        match name {
            "linear" => Some(Self::Linear),
            "mlp2x_gelu" => Some(Self::Mlp),
            n if n.starts_with("st_cdpnet") || n.starts_with("st_2d_cdpnet") => Some(Self::Mlp),
            _ => None,
        }
    }
}

/// Configuration for the feed-forward projector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectorConfig {
    pub projector_type: ProjectorType,
    /// Width of the selected visual tokens.
    pub vision_hidden_size: usize,
    /// Language model hidden size.
    pub llm_hidden_size: usize,
}

impl ProjectorConfig {
    pub fn linear(vision_hidden_size: usize, llm_hidden_size: usize) -> Self {
        Self {
            projector_type: ProjectorType::Linear,
            vision_hidden_size,
            llm_hidden_size,
        }
    }

    pub fn mlp(vision_hidden_size: usize, llm_hidden_size: usize) -> Self {
        Self {
            projector_type: ProjectorType::Mlp,
            vision_hidden_size,
            llm_hidden_size,
        }
    }
}

enum ProjectorLayers {
    Linear(Linear),
    Mlp { fc1: Linear, fc2: Linear },
}

/// Feed-forward projector mapping visual tokens to LLM space.
pub struct MultimodalProjector {
    cfg: ProjectorConfig,
    layers: ProjectorLayers,
}

impl MultimodalProjector {
    pub fn new(cfg: &ProjectorConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.vision_hidden_size == 0 || cfg.llm_hidden_size == 0 {
            return Err(FusionError::InvalidConfig(format!(
                "projector widths must be positive, got {} -> {}",
                cfg.vision_hidden_size, cfg.llm_hidden_size
            )));
        }
        let layers = match cfg.projector_type {
            ProjectorType::Linear => ProjectorLayers::Linear(linear(
                cfg.vision_hidden_size,
                cfg.llm_hidden_size,
                vb.pp("linear"),
            )?),
            ProjectorType::Mlp => {
                // nn.Sequential(Linear, GELU, Linear) numbering
                let vb = vb.pp("mlp");
                let fc1 = linear(cfg.vision_hidden_size, cfg.llm_hidden_size, vb.pp("0"))?;
                let fc2 = linear(cfg.llm_hidden_size, cfg.llm_hidden_size, vb.pp("2"))?;
                ProjectorLayers::Mlp { fc1, fc2 }
            }
        };
        Ok(Self {
            cfg: cfg.clone(),
            layers,
        })
    }

    /// Project `[..., vision_hidden]` to `[..., llm_hidden]`.
    pub fn project(&self, vision_embeddings: &Tensor) -> Result<Tensor> {
        let width = vision_embeddings.dim(candle_core::D::Minus1)?;
        if width != self.cfg.vision_hidden_size {
            return Err(FusionError::IncompatibleFeatureShape(format!(
                "projector expects width {}, got {width}",
                self.cfg.vision_hidden_size
            )));
        }
        let out = match &self.layers {
            ProjectorLayers::Linear(fc) => fc.forward(vision_embeddings)?,
            ProjectorLayers::Mlp { fc1, fc2 } => {
                fc2.forward(&fc1.forward(vision_embeddings)?.gelu_erf()?)?
            }
        };
        Ok(out)
    }

    pub fn projector_type(&self) -> ProjectorType {
        self.cfg.projector_type
    }

    pub fn llm_hidden_size(&self) -> usize {
        self.cfg.llm_hidden_size
    }
}

/// Downsampler + projector: patch features in, LLM-space image slots out.
pub struct SpatiotemporalProjector {
    dwn: SpatiotemporalDownsampler,
    mlp: MultimodalProjector,
}

impl SpatiotemporalProjector {
    pub fn new(
        selector: &SelectorConfig,
        projector: &ProjectorConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let dwn = SpatiotemporalDownsampler::new(selector, projector.vision_hidden_size, vb.pp("dwn"))?;
        let mlp = MultimodalProjector::new(projector, vb.pp("mlp"))?;
        Ok(Self { dwn, mlp })
    }

    /// `[t, n, c]` (or `[n, c]`) patch features -> `[fused_len(t), llm_hidden]`.
    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let selected = self.dwn.forward(features)?;
        self.mlp.project(&selected)
    }

    pub fn downsampler(&self) -> &SpatiotemporalDownsampler {
        &self.dwn
    }

    pub fn projector(&self) -> &MultimodalProjector {
        &self.mlp
    }
}
