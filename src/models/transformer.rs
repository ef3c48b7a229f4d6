//! Inference-only transformer encoder.
//!
//! Each block is post-norm: multi-head self-attention with a residual
//! connection and layer normalisation, followed by a two-layer feed-forward
//! network with its own residual connection and normalisation. Dropout is
//! the identity at inference time and is not represented.
use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use rand::Rng;

use super::layers::{softmax_rows, Activation, LayerNorm, Linear};
use crate::config::Config;
use crate::ConfigError;

#[derive(Clone, Debug)]
struct MultiHeadAttention {
    n_heads: usize,
    head_size: usize,
    query: Linear,
    key: Linear,
    value: Linear,
    dense: Linear,
    layer_norm: LayerNorm,
}

impl MultiHeadAttention {
    fn forward(&self, input: ArrayView2<f32>, mask: ArrayView2<f32>) -> Array2<f32> {
        let queries = self.query.forward(input);
        let keys = self.key.forward(input);
        let values = self.value.forward(input);

        let scale = (self.head_size as f32).sqrt();
        let mut context = Array2::zeros(input.dim());

        for head in 0..self.n_heads {
            let start = head * self.head_size;
            let stop = start + self.head_size;

            let q = queries.slice(s![.., start..stop]);
            let k = keys.slice(s![.., start..stop]);
            let v = values.slice(s![.., start..stop]);

            let mut attention = q.dot(&k.t()) / scale + &mask;
            softmax_rows(&mut attention);

            context
                .slice_mut(s![.., start..stop])
                .assign(&attention.dot(&v));
        }

        let hidden = self.dense.forward(context.view());
        self.layer_norm.forward((&hidden + &input).view())
    }

    fn num_parameters(&self) -> usize {
        self.query.num_parameters()
            + self.key.num_parameters()
            + self.value.num_parameters()
            + self.dense.num_parameters()
            + self.layer_norm.num_parameters()
    }
}

#[derive(Clone, Debug)]
struct FeedForward {
    dense_1: Linear,
    dense_2: Linear,
    activation: Activation,
    layer_norm: LayerNorm,
}

impl FeedForward {
    fn forward(&self, input: ArrayView2<f32>) -> Array2<f32> {
        let activation = self.activation;
        let hidden = self.dense_1.forward(input).mapv(|x| activation.apply(x));
        let hidden = self.dense_2.forward(hidden.view());

        self.layer_norm.forward((&hidden + &input).view())
    }

    fn num_parameters(&self) -> usize {
        self.dense_1.num_parameters() + self.dense_2.num_parameters() + self.layer_norm.num_parameters()
    }
}

#[derive(Clone, Debug)]
struct TransformerLayer {
    attention: MultiHeadAttention,
    feed_forward: FeedForward,
}

impl TransformerLayer {
    fn new<R: Rng>(config: &Config, activation: Activation, rng: &mut R) -> Self {
        let hidden = config.hidden_size;
        let std = config.initializer_range;

        TransformerLayer {
            attention: MultiHeadAttention {
                n_heads: config.n_heads,
                head_size: hidden / config.n_heads,
                query: Linear::new(hidden, hidden, std, rng),
                key: Linear::new(hidden, hidden, std, rng),
                value: Linear::new(hidden, hidden, std, rng),
                dense: Linear::new(hidden, hidden, std, rng),
                layer_norm: LayerNorm::new(hidden, config.layer_norm_eps),
            },
            feed_forward: FeedForward {
                dense_1: Linear::new(hidden, config.inner_size, std, rng),
                dense_2: Linear::new(config.inner_size, hidden, std, rng),
                activation,
                layer_norm: LayerNorm::new(hidden, config.layer_norm_eps),
            },
        }
    }

    fn forward(&self, input: ArrayView2<f32>, mask: ArrayView2<f32>) -> Array2<f32> {
        let attended = self.attention.forward(input, mask);
        self.feed_forward.forward(attended.view())
    }
}

/// Stack of self-attention blocks.
#[derive(Clone, Debug)]
pub struct TransformerEncoder {
    layers: Vec<TransformerLayer>,
}

impl TransformerEncoder {
    /// Build `n_layers` blocks from the configuration.
    pub fn new<R: Rng>(config: &Config, rng: &mut R) -> Result<Self, ConfigError> {
        if config.n_heads == 0 || config.hidden_size % config.n_heads != 0 {
            return Err(ConfigError::InvalidHeads {
                hidden_size: config.hidden_size,
                n_heads: config.n_heads,
            });
        }

        let activation = config.hidden_act.parse::<Activation>()?;
        let layers = (0..config.n_layers)
            .map(|_| TransformerLayer::new(config, activation, rng))
            .collect();

        Ok(TransformerEncoder { layers })
    }

    /// Number of blocks.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Encode `batch x length x hidden` inputs.
    ///
    /// `mask` is `batch x length x length` and is added to the attention
    /// logits: 0 where attention is allowed, a large negative value where it
    /// is not. Returns the output of every block when
    /// `output_all_encoded_layers` is set, otherwise only the last one.
    pub fn forward(
        &self,
        input: &Array3<f32>,
        mask: &Array3<f32>,
        output_all_encoded_layers: bool,
    ) -> Vec<Array3<f32>> {
        let mut outputs = Vec::with_capacity(self.layers.len());
        let mut hidden = input.clone();

        for layer in &self.layers {
            let mut next = Array3::zeros(hidden.dim());

            for (idx, mut out) in next.outer_iter_mut().enumerate() {
                out.assign(&layer.forward(
                    hidden.index_axis(Axis(0), idx),
                    mask.index_axis(Axis(0), idx),
                ));
            }

            hidden = next;
            if output_all_encoded_layers {
                outputs.push(hidden.clone());
            }
        }

        if !output_all_encoded_layers {
            outputs.push(hidden);
        }

        outputs
    }

    /// Number of trainable values.
    pub fn num_parameters(&self) -> usize {
        self.layers
            .iter()
            .map(|layer| layer.attention.num_parameters() + layer.feed_forward.num_parameters())
            .sum()
    }
}
