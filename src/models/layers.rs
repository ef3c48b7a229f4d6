//! Dense building blocks shared by the models: linear maps, layer
//! normalisation, activations and embedding lookups.
use std::str::FromStr;

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::ConfigError;

/// `rows x cols` matrix drawn from `N(0, std^2)`.
pub fn normal_init<R: Rng>(rows: usize, cols: usize, std: f32, rng: &mut R) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| {
        let sample: f32 = rng.sample(StandardNormal);
        sample * std
    })
}

/// Logistic function.
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

// Abramowitz and Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f32) -> f32 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs() as f64;
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));

    sign * (1.0 - poly * (-x * x).exp()) as f32
}

/// Hidden activation of the feed-forward blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    /// Gaussian error linear unit, erf form.
    Gelu,
    /// Rectified linear unit.
    Relu,
    /// `x * sigmoid(x)`.
    Swish,
    /// Hyperbolic tangent.
    Tanh,
    /// Logistic function.
    Sigmoid,
}

impl FromStr for Activation {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "gelu" => Ok(Activation::Gelu),
            "relu" => Ok(Activation::Relu),
            "swish" => Ok(Activation::Swish),
            "tanh" => Ok(Activation::Tanh),
            "sigmoid" => Ok(Activation::Sigmoid),
            other => Err(ConfigError::UnsupportedActivation(other.to_owned())),
        }
    }
}

impl Activation {
    /// Apply to a single value.
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Gelu => x * 0.5 * (1.0 + erf(x / ::std::f32::consts::SQRT_2)),
            Activation::Relu => x.max(0.0),
            Activation::Swish => x * sigmoid(x),
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => sigmoid(x),
        }
    }
}

/// Affine map `y = x W^T + b`.
#[derive(Clone, Debug)]
pub struct Linear {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl Linear {
    /// Normally initialised weights, zero bias.
    pub fn new<R: Rng>(input_dim: usize, output_dim: usize, std: f32, rng: &mut R) -> Self {
        Linear {
            weight: normal_init(output_dim, input_dim, std, rng),
            bias: Array1::zeros(output_dim),
        }
    }

    /// Build from explicit parameters; `weight` is `output x input`.
    pub fn from_parameters(weight: Array2<f32>, bias: Array1<f32>) -> Self {
        assert_eq!(weight.nrows(), bias.len(), "one bias per output unit");
        Linear { weight, bias }
    }

    /// `output x input` weight matrix.
    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    /// Mutable weights, for an external optimizer.
    pub fn weight_mut(&mut self) -> &mut Array2<f32> {
        &mut self.weight
    }

    /// Bias vector.
    pub fn bias(&self) -> &Array1<f32> {
        &self.bias
    }

    /// Mutable bias, for an external optimizer.
    pub fn bias_mut(&mut self) -> &mut Array1<f32> {
        &mut self.bias
    }

    /// Apply to every row of `input`.
    pub fn forward(&self, input: ArrayView2<f32>) -> Array2<f32> {
        input.dot(&self.weight.t()) + &self.bias
    }

    /// Apply to every row of every sequence in `input`.
    pub fn forward_sequences(&self, input: &Array3<f32>) -> Array3<f32> {
        let (batch, length, _) = input.dim();
        let mut output = Array3::zeros((batch, length, self.weight.nrows()));

        for (sequence, mut out) in input.outer_iter().zip(output.outer_iter_mut()) {
            out.assign(&self.forward(sequence));
        }

        output
    }

    /// Number of trainable values.
    pub fn num_parameters(&self) -> usize {
        self.weight.len() + self.bias.len()
    }
}

/// Layer normalisation over the last axis.
#[derive(Clone, Debug)]
pub struct LayerNorm {
    gamma: Array1<f32>,
    beta: Array1<f32>,
    eps: f32,
}

impl LayerNorm {
    /// Unit scale, zero shift.
    pub fn new(dim: usize, eps: f32) -> Self {
        LayerNorm {
            gamma: Array1::ones(dim),
            beta: Array1::zeros(dim),
            eps,
        }
    }

    /// Normalise every row of `input`.
    pub fn forward(&self, input: ArrayView2<f32>) -> Array2<f32> {
        let mut output = input.to_owned();

        for mut row in output.outer_iter_mut() {
            let n = row.len() as f32;
            let mean = row.sum() / n;
            let variance = row.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n;
            let inv_std = 1.0 / (variance + self.eps).sqrt();

            for (x, &gamma, &beta) in izip!(row.iter_mut(), &self.gamma, &self.beta) {
                *x = gamma * (*x - mean) * inv_std + beta;
            }
        }

        output
    }

    /// Normalise every position of every sequence in `input`.
    pub fn forward_sequences(&self, input: &Array3<f32>) -> Array3<f32> {
        let mut output = Array3::zeros(input.dim());

        for (sequence, mut out) in input.outer_iter().zip(output.outer_iter_mut()) {
            out.assign(&self.forward(sequence));
        }

        output
    }

    /// Number of trainable values.
    pub fn num_parameters(&self) -> usize {
        self.gamma.len() + self.beta.len()
    }
}

/// Rows of `table` at `indices`, in order.
pub fn gather_rows(table: &Array2<f32>, indices: ArrayView1<usize>) -> Array2<f32> {
    let indices: Vec<usize> = indices.iter().cloned().collect();
    table.select(Axis(0), &indices)
}

/// Row-wise dot products of two equally shaped matrices.
pub fn row_dot(left: ArrayView2<f32>, right: ArrayView2<f32>) -> Array1<f32> {
    (&left * &right).sum_axis(Axis(1))
}

/// In-place softmax over every row.
pub fn softmax_rows(values: &mut Array2<f32>) {
    for mut row in values.outer_iter_mut() {
        let max = row.iter().cloned().fold(::std::f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|x| x / sum);
    }
}
