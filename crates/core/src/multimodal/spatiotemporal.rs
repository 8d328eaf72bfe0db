//! Spatiotemporal downsampling of vision-encoder patch features.
//!
//! ```text
//! [t, 1 + h*w, c]
//!   ├─ class tokens [t, c] ─────────────────────────────┐
//!   └─ grid [t, c, h, w]                                 │
//!        → Conv3d (kt,3,3) stride (1,2,2)  [t, c, h', w']│
//!        → + PEG Conv3d (1,3,3) residual                 │
//!        → GlobalLocalSelector ◄─────────────────────────┘
//!        → LayerNorm (optional)
//! [N, c]
//! ```
//!
//! Candle has no 3-D convolution, so the temporal conv runs one `Conv2d` per
//! temporal tap and sums the frame-shifted results. With the default
//! temporal kernel of 1 this is a single strided `Conv2d`.

use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, LayerNorm, VarBuilder};

use super::error::{FusionError, Result};
use super::selector::GlobalLocalSelector;

const SPATIAL_KERNEL: usize = 3;
const SPATIAL_STRIDE: usize = 2;
const SPATIAL_PADDING: usize = 1;

/// Configuration of the spatiotemporal feature selector.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorConfig {
    /// Patch grid height produced by the vision encoder.
    pub feature_h: usize,
    /// Patch grid width produced by the vision encoder.
    pub feature_w: usize,
    /// Target grid height after downsampling.
    pub final_h: usize,
    /// Target grid width after downsampling.
    pub final_w: usize,
    /// Locally salient tokens kept from the reference frame.
    pub extend_token_num: usize,
    /// Frames per image/clip the model is configured for.
    pub num_frames: usize,
    /// Temporal receptive field of the downsampling conv (odd).
    pub temporal_kernel: usize,
    /// Whether each frame leads with a class token.
    pub class_token: bool,
    /// Use a dense instead of depthwise positional-enhancement conv.
    pub peg_standard_conv: bool,
    /// Layer-normalize the fused set.
    pub use_post_norm: bool,
    pub post_norm_eps: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            feature_h: 32,
            feature_w: 80,
            final_h: 12,
            final_w: 30,
            extend_token_num: 120,
            num_frames: 1,
            temporal_kernel: 1,
            class_token: true,
            peg_standard_conv: false,
            use_post_norm: true,
            post_norm_eps: 1e-5,
        }
    }
}

impl SelectorConfig {
    /// Grid size after the strided conv.
    pub fn conv_grid(&self) -> (usize, usize) {
        let out = |x: usize| (x + 2 * SPATIAL_PADDING - SPATIAL_KERNEL) / SPATIAL_STRIDE + 1;
        (out(self.feature_h), out(self.feature_w))
    }

    /// Reduced patch count per frame (n').
    pub fn grid_tokens(&self) -> usize {
        self.final_h * self.final_w
    }

    /// Fused token count for `frames` frames.
    pub fn fused_len(&self, frames: usize) -> usize {
        let n = self.grid_tokens();
        match frames {
            0 => 0,
            1 => n + usize::from(self.class_token),
            t => 1 + self.extend_token_num + (t - 1) * (1 + n),
        }
    }

    /// Fused token count for the configured frame count.
    pub fn output_len(&self) -> usize {
        self.fused_len(self.num_frames)
    }

    pub fn validate(&self) -> Result<()> {
        if self.feature_h == 0 || self.feature_w == 0 {
            return Err(FusionError::IncompatibleFeatureShape(format!(
                "feature grid {}x{} is empty",
                self.feature_h, self.feature_w
            )));
        }
        if self.final_h == 0 || self.final_w == 0 {
            return Err(FusionError::InvalidSelectorConfig(format!(
                "target grid {}x{} is empty",
                self.final_h, self.final_w
            )));
        }
        if self.extend_token_num > self.grid_tokens() {
            return Err(FusionError::InvalidSelectorConfig(format!(
                "extend_token_num {} exceeds the {} reduced patches",
                self.extend_token_num,
                self.grid_tokens()
            )));
        }
        if self.num_frames == 0 {
            return Err(FusionError::InvalidSelectorConfig(
                "num_frames must be at least 1".to_string(),
            ));
        }
        if self.num_frames > 1 && !self.class_token {
            return Err(FusionError::InvalidSelectorConfig(
                "multi-frame selection needs per-frame class tokens".to_string(),
            ));
        }
        if self.temporal_kernel % 2 == 0 {
            return Err(FusionError::InvalidSelectorConfig(format!(
                "temporal_kernel must be odd, got {}",
                self.temporal_kernel
            )));
        }
        let (h, w) = self.conv_grid();
        if h < self.final_h || w < self.final_w {
            return Err(FusionError::IncompatibleFeatureShape(format!(
                "{}x{} features downsample to {}x{}, smaller than the {}x{} target",
                self.feature_h, self.feature_w, h, w, self.final_h, self.final_w
            )));
        }
        Ok(())
    }
}

/// Conv3d with kernel `(kt, 3, 3)`, stride `(1, 2, 2)`, padding `(kt/2, 1, 1)`, no bias.
///
/// Frame count is preserved so grid frames stay aligned with class tokens.
struct TemporalConv3d {
    taps: Vec<Conv2d>,
    temporal_padding: usize,
}

impl TemporalConv3d {
    fn new(channels: usize, temporal_kernel: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get(
            (channels, channels, temporal_kernel, SPATIAL_KERNEL, SPATIAL_KERNEL),
            "weight",
        )?;
        let cfg = Conv2dConfig {
            padding: SPATIAL_PADDING,
            stride: SPATIAL_STRIDE,
            ..Default::default()
        };
        let taps = (0..temporal_kernel)
            .map(|k| {
                let tap = weight.narrow(2, k, 1)?.squeeze(2)?.contiguous()?;
                Ok(Conv2d::new(tap, None, cfg))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            taps,
            temporal_padding: temporal_kernel / 2,
        })
    }

    /// `[t, c, h, w]` -> `[t, c, h', w']`
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mut acc: Option<Tensor> = None;
        for (k, tap) in self.taps.iter().enumerate() {
            let y = shift_frames(&tap.forward(x)?, k as isize - self.temporal_padding as isize)?;
            acc = Some(match acc {
                Some(sum) => (sum + y)?,
                None => y,
            });
        }
        acc.ok_or_else(|| candle_core::Error::Msg("temporal conv without taps".to_string()))
    }
}

/// `out[j] = y[j + offset]`, zero outside `[0, t)`.
fn shift_frames(y: &Tensor, offset: isize) -> candle_core::Result<Tensor> {
    if offset == 0 {
        return Ok(y.clone());
    }
    let t = y.dim(0)?;
    let shift = offset.unsigned_abs();
    if shift >= t {
        return y.zeros_like();
    }
    let mut pad_dims = y.dims().to_vec();
    pad_dims[0] = shift;
    let pad = Tensor::zeros(pad_dims, y.dtype(), y.device())?;
    if offset > 0 {
        Tensor::cat(&[&y.narrow(0, shift, t - shift)?, &pad], 0)
    } else {
        Tensor::cat(&[&pad, &y.narrow(0, 0, t - shift)?], 0)
    }
}

/// Positional enhancement: Conv3d `(1, 3, 3)` with bias, applied residually.
fn peg_conv(channels: usize, standard: bool, vb: VarBuilder) -> Result<Conv2d> {
    let groups = if standard { 1 } else { channels };
    let weight = vb.get(
        (channels, channels / groups, 1, SPATIAL_KERNEL, SPATIAL_KERNEL),
        "weight",
    )?;
    let bias = vb.get(channels, "bias")?;
    let cfg = Conv2dConfig {
        padding: SPATIAL_PADDING,
        groups,
        ..Default::default()
    };
    Ok(Conv2d::new(weight.squeeze(2)?, Some(bias), cfg))
}

/// Downsampling layer feeding the global/local selector.
pub struct SpatiotemporalDownsampler {
    cfg: SelectorConfig,
    channels: usize,
    cnn_dwn: TemporalConv3d,
    peg: Conv2d,
    selector: GlobalLocalSelector,
    post_norm: Option<LayerNorm>,
}

impl SpatiotemporalDownsampler {
    /// Load from `vb` (`cnn_dwn`, `peg.0`, `post_norm`).
    pub fn new(cfg: &SelectorConfig, channels: usize, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        if channels == 0 {
            return Err(FusionError::InvalidSelectorConfig(
                "vision channel width must be positive".to_string(),
            ));
        }

        let cnn_dwn = TemporalConv3d::new(channels, cfg.temporal_kernel, vb.pp("cnn_dwn"))?;
        let peg = peg_conv(channels, cfg.peg_standard_conv, vb.pp("peg").pp("0"))?;
        let selector = GlobalLocalSelector::new(cfg.extend_token_num, cfg.final_h, cfg.final_w)?;
        let post_norm = if cfg.use_post_norm {
            Some(candle_nn::layer_norm(
                channels,
                cfg.post_norm_eps,
                vb.pp("post_norm"),
            )?)
        } else {
            None
        };

        tracing::info!(
            extend_token_num = cfg.extend_token_num,
            feature_grid = ?(cfg.feature_h, cfg.feature_w),
            final_grid = ?(cfg.final_h, cfg.final_w),
            fused_tokens = cfg.output_len(),
            "Using spatiotemporal global-local feature selector"
        );

        Ok(Self {
            cfg: cfg.clone(),
            channels,
            cnn_dwn,
            peg,
            selector,
            post_norm,
        })
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.cfg
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Compress patch features into one fused token set.
    ///
    /// * `features` - `[t, n, c]` or `[n, c]` for a single frame; `n` odd means
    ///   token 0 of every frame is its class token.
    ///
    /// Returns `[fused_len(t), c]`.
    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let features = match features.rank() {
            2 => features.unsqueeze(0)?,
            3 => features.clone(),
            r => {
                return Err(FusionError::IncompatibleFeatureShape(format!(
                    "patch features must be [t, n, c] or [n, c], got rank {r}"
                )))
            }
        };
        let (t, n, c) = features.dims3()?;
        if c != self.channels {
            return Err(FusionError::IncompatibleFeatureShape(format!(
                "expected {} channels, got {c}",
                self.channels
            )));
        }

        let has_class_token = n % 2 == 1;
        if has_class_token != self.cfg.class_token {
            return Err(FusionError::IncompatibleFeatureShape(format!(
                "{n} tokens per frame {} a class token, configuration {} one",
                if has_class_token { "imply" } else { "exclude" },
                if self.cfg.class_token { "expects" } else { "forbids" },
            )));
        }
        let (cls_tokens, grid) = if has_class_token {
            (
                Some(features.narrow(1, 0, 1)?.squeeze(1)?),
                features.narrow(1, 1, n - 1)?,
            )
        } else {
            (None, features)
        };

        let (h, w) = (self.cfg.feature_h, self.cfg.feature_w);
        let grid_tokens = grid.dim(1)?;
        if grid_tokens != h * w {
            return Err(FusionError::IncompatibleFeatureShape(format!(
                "{grid_tokens} patch tokens do not form the configured {h}x{w} grid"
            )));
        }

        let x = grid.transpose(1, 2)?.reshape((t, c, h, w))?;
        let x = self.cnn_dwn.forward(&x)?;
        let x = (self.peg.forward(&x)? + &x)?;

        let fused = self.selector.select(&x, cls_tokens.as_ref())?;
        match &self.post_norm {
            Some(norm) => Ok(norm.forward(&fused)?),
            None => Ok(fused),
        }
    }
}
