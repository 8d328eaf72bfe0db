//! Global/local visual token selection.
//!
//! Input is a downsampled per-frame feature grid `[t, c, h, w]` plus the
//! per-frame class tokens `[t, c]`. Output is one fused token set:
//!
//! ```text
//! t == 1:  [cls_0] ++ grid_0
//! t >= 2:  [cls_0] ++ top_k(grid_0) ++ [cls_1] ++ grid_1 ++ ... ++ [cls_{t-1}] ++ grid_{t-1}
//! ```
//!
//! Frame 0 is the reference frame: its class token scores every grid token
//! with scaled dot-product attention and only the `extend_token_num` best
//! tokens of that frame are kept. The remaining frames contribute their full
//! grids.

use candle_core::{DType, Device, Tensor, D};

use super::error::{FusionError, Result};

/// Token selector over a fixed target grid.
#[derive(Debug, Clone)]
pub struct GlobalLocalSelector {
    extend_token_num: usize,
    final_h: usize,
    final_w: usize,
}

impl GlobalLocalSelector {
    pub fn new(extend_token_num: usize, final_h: usize, final_w: usize) -> Result<Self> {
        if final_h == 0 || final_w == 0 {
            return Err(FusionError::InvalidSelectorConfig(format!(
                "target grid {final_h}x{final_w} is empty"
            )));
        }
        if extend_token_num > final_h * final_w {
            return Err(FusionError::InvalidSelectorConfig(format!(
                "extend_token_num {} exceeds the {} tokens of a {}x{} grid",
                extend_token_num,
                final_h * final_w,
                final_h,
                final_w
            )));
        }
        Ok(Self {
            extend_token_num,
            final_h,
            final_w,
        })
    }

    pub fn extend_token_num(&self) -> usize {
        self.extend_token_num
    }

    /// Tokens per frame after downsampling.
    pub fn grid_tokens(&self) -> usize {
        self.final_h * self.final_w
    }

    /// Length of the fused set for `frames` frames.
    pub fn fused_len(&self, frames: usize, with_class_token: bool) -> usize {
        let n = self.grid_tokens();
        match frames {
            0 => 0,
            1 => n + usize::from(with_class_token),
            t => 1 + self.extend_token_num + (t - 1) * (1 + n),
        }
    }

    /// Select the fused token set.
    ///
    /// * `grid` - `[t, c, h, w]`
    /// * `cls_tokens` - `[t, c]`, required when `t > 1`
    ///
    /// Returns `[fused_len, c]`.
    pub fn select(&self, grid: &Tensor, cls_tokens: Option<&Tensor>) -> Result<Tensor> {
        let (t, c, _, _) = grid.dims4()?;
        if let Some(cls) = cls_tokens {
            let (ct, cc) = cls.dims2()?;
            if ct != t || cc != c {
                return Err(FusionError::IncompatibleFeatureShape(format!(
                    "class tokens [{ct}, {cc}] do not match grid of {t} frames x {c} channels"
                )));
            }
        }

        let tokens = self.to_tokens(grid)?; // [t, n, c]

        if t == 1 {
            let frame = tokens.get(0)?;
            return Ok(match cls_tokens {
                Some(cls) => Tensor::cat(&[&cls.narrow(0, 0, 1)?, &frame], 0)?,
                None => frame,
            });
        }

        let cls = cls_tokens.ok_or_else(|| {
            FusionError::IncompatibleFeatureShape(format!(
                "{t} frames require per-frame class tokens for attention ranking"
            ))
        })?;

        let scores = attention_scores(&tokens, cls)?; // [t, n]
        let reference: Vec<f32> = scores.get(0)?.to_vec1()?;
        let keep = top_k_indices(&reference, self.extend_token_num);
        let num_local = keep.len();
        let keep = Tensor::from_vec(keep, num_local, grid.device())?;
        let local = tokens.get(0)?.index_select(&keep, 0)?;

        let mut parts = Vec::with_capacity(2 * t);
        parts.push(cls.narrow(0, 0, 1)?);
        parts.push(local);
        for frame in 1..t {
            parts.push(cls.narrow(0, frame, 1)?);
            parts.push(tokens.get(frame)?);
        }
        Ok(Tensor::cat(&parts, 0)?)
    }

    /// Resize to the target grid when needed and flatten to `[t, h*w, c]`.
    fn to_tokens(&self, grid: &Tensor) -> Result<Tensor> {
        let (t, c, h, w) = grid.dims4()?;
        let grid = if h == self.final_h && w == self.final_w {
            grid.clone()
        } else {
            if h < self.final_h || w < self.final_w {
                return Err(FusionError::IncompatibleFeatureShape(format!(
                    "grid {h}x{w} cannot be downsampled to {}x{}",
                    self.final_h, self.final_w
                )));
            }
            resize_bilinear(grid, self.final_h, self.final_w)?
        };
        Ok(grid
            .permute((0, 2, 3, 1))?
            .reshape((t, self.final_h * self.final_w, c))?)
    }
}

/// Per-frame class-token attention over grid tokens, normalized by the frame max.
///
/// * `tokens` - `[t, n, c]`
/// * `cls_tokens` - `[t, c]`
///
/// Returns `[t, n]` in f32. Values are only meaningful for ranking.
pub fn attention_scores(tokens: &Tensor, cls_tokens: &Tensor) -> Result<Tensor> {
    let (_, _, c) = tokens.dims3()?;
    let keys = tokens.to_dtype(DType::F32)?.transpose(1, 2)?.contiguous()?; // [t, c, n]
    let query = cls_tokens.to_dtype(DType::F32)?.contiguous()?.unsqueeze(1)?; // [t, 1, c]
    let logits = (query.matmul(&keys)?.squeeze(1)? / (c as f64).sqrt())?;
    let probs = candle_nn::ops::softmax_last_dim(&logits)?;
    let max = probs.max_keepdim(D::Minus1)?;
    Ok(probs.broadcast_div(&max)?)
}

/// Indices of the `k` highest scores, best first; equal scores keep the lower index first.
pub fn top_k_indices(scores: &[f32], k: usize) -> Vec<u32> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    // Stable sort: ties stay in ascending index order.
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    order.into_iter().take(k).map(|i| i as u32).collect()
}

/// Bilinear resize of `[t, c, h, w]` to `[t, c, out_h, out_w]` with
/// `align_corners = false` and no antialiasing.
///
/// Bilinear interpolation is separable, so the resize is two matmuls against
/// host-built interpolation matrices.
pub fn resize_bilinear(x: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let (t, c, h, w) = x.dims4()?;
    let dtype = x.dtype();
    let device = x.device();
    let rw = interpolation_matrix(w, out_w, device)?.to_dtype(dtype)?; // [w, out_w]
    let rh = interpolation_matrix(h, out_h, device)?.to_dtype(dtype)?; // [h, out_h]

    let x = x.reshape((t * c * h, w))?.matmul(&rw)?; // [t*c*h, out_w]
    let x = x
        .reshape((t, c, h, out_w))?
        .transpose(2, 3)?
        .contiguous()?
        .reshape((t * c * out_w, h))?
        .matmul(&rh)?; // [t*c*out_w, out_h]
    Ok(x.reshape((t, c, out_w, out_h))?.transpose(2, 3)?.contiguous()?)
}

/// Weights `[in_size, out_size]`; column `o` holds the source mix for output `o`.
fn interpolation_matrix(in_size: usize, out_size: usize, device: &Device) -> Result<Tensor> {
    let weights = interpolation_weights(in_size, out_size);
    Ok(Tensor::from_vec(weights, (in_size, out_size), device)?)
}

pub(crate) fn interpolation_weights(in_size: usize, out_size: usize) -> Vec<f32> {
    let mut weights = vec![0f32; in_size * out_size];
    let scale = in_size as f32 / out_size as f32;
    for o in 0..out_size {
        let src = ((o as f32 + 0.5) * scale - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(in_size - 1);
        let i1 = (i0 + 1).min(in_size - 1);
        let frac = src - i0 as f32;
        weights[i0 * out_size + o] += 1.0 - frac;
        weights[i1 * out_size + o] += frac;
    }
    weights
}
