//! Vision tower adapter.
//!
//! The vision encoder itself is a black box that returns its per-layer hidden
//! states. Which layers feed the projector is decided once, at configuration
//! time, through [`LayerSelection`].

use candle_core::Tensor;

use super::error::{FusionError, Result};

/// Vision encoder producing per-layer patch features.
pub trait VisionEncoder: Send + Sync {
    /// Channel width of one hidden state.
    fn hidden_size(&self) -> usize;

    /// Hidden states of every layer, each `[t, n, c]`, first layer first.
    fn hidden_states(&self, pixel_values: &Tensor) -> candle_core::Result<Vec<Tensor>>;
}

/// Which encoder layers form the patch features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerSelection {
    /// One layer; negative indices count from the end.
    Single { layer: isize },
    /// Mean of the last `last` layers.
    CompoundMean { last: usize },
    /// Final layer concatenated with the means of the first and second half
    /// of the last `last` layers (dense connector). Triples the width.
    DenseConnector { last: usize },
}

impl Default for LayerSelection {
    fn default() -> Self {
        Self::Single { layer: -1 }
    }
}

impl LayerSelection {
    /// Channel width of the selected features for an encoder of width `hidden`.
    pub fn output_channels(&self, hidden: usize) -> usize {
        match self {
            Self::Single { .. } | Self::CompoundMean { .. } => hidden,
            Self::DenseConnector { .. } => 3 * hidden,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::Single { .. } => Ok(()),
            Self::CompoundMean { last } if last == 0 => Err(FusionError::InvalidConfig(
                "compound layer selection needs at least one layer".to_string(),
            )),
            Self::DenseConnector { last } if last < 2 || last % 2 != 0 => {
                Err(FusionError::InvalidConfig(format!(
                    "dense connector needs an even layer count of at least 2, got {last}"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Reduce per-layer hidden states to one `[t, n, c']` feature tensor.
    pub fn resolve(&self, hidden_states: &[Tensor]) -> Result<Tensor> {
        let available = hidden_states.len();
        match *self {
            Self::Single { layer } => {
                let idx = if layer < 0 {
                    available as isize + layer
                } else {
                    layer
                };
                if idx < 0 || idx as usize >= available {
                    return Err(FusionError::IncompatibleFeatureShape(format!(
                        "layer {layer} requested from {available} hidden states"
                    )));
                }
                Ok(hidden_states[idx as usize].clone())
            }
            Self::CompoundMean { last } => mean_of(tail(hidden_states, last)?),
            Self::DenseConnector { last } => {
                let layers = tail(hidden_states, last)?;
                let half = last / 2;
                let final_layer = &layers[last - 1];
                let low = mean_of(&layers[..half])?;
                let high = mean_of(&layers[half..])?;
                let rank = final_layer.rank();
                Ok(Tensor::cat(&[final_layer, &low, &high], rank.saturating_sub(1))?)
            }
        }
    }
}

fn tail(hidden_states: &[Tensor], last: usize) -> Result<&[Tensor]> {
    if last == 0 || last > hidden_states.len() {
        return Err(FusionError::IncompatibleFeatureShape(format!(
            "{last} layers requested from {} hidden states",
            hidden_states.len()
        )));
    }
    Ok(&hidden_states[hidden_states.len() - last..])
}

fn mean_of(layers: &[Tensor]) -> Result<Tensor> {
    Ok(Tensor::stack(layers, 0)?.mean(0)?)
}

/// Vision encoder plus its configured layer selection.
pub struct VisionTower<V> {
    encoder: V,
    selection: LayerSelection,
}

impl<V: VisionEncoder> VisionTower<V> {
    pub fn new(encoder: V, selection: LayerSelection) -> Result<Self> {
        selection.validate()?;
        Ok(Self { encoder, selection })
    }

    /// Patch features `[t, n, c']` for one image or clip.
    pub fn encode(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let hidden_states = self.encoder.hidden_states(pixel_values)?;
        self.selection.resolve(&hidden_states)
    }

    /// Width of the features returned by [`Self::encode`].
    pub fn output_channels(&self) -> usize {
        self.selection.output_channels(self.encoder.hidden_size())
    }

    pub fn selection(&self) -> LayerSelection {
        self.selection
    }

    pub fn encoder(&self) -> &V {
        &self.encoder
    }
}
