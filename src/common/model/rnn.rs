use anyhow::{bail, Result};
use burn::module::Module;
use burn::nn::Linear;
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use rand::rngs::StdRng;

use super::init::orthogonal_linear;

/// Host copy of the recurrent carry, one row per actor (`agent * num_envs + env`).
#[derive(Clone, Debug, PartialEq)]
pub struct HiddenState {
    batch: usize,
    width: usize,
    data: Vec<f32>,
}

impl HiddenState {
    pub fn zeros(batch: usize, width: usize) -> Self {
        Self {
            batch,
            width,
            data: vec![0.0; batch * width],
        }
    }

    pub fn from_vec(batch: usize, width: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != batch * width {
            bail!(
                "hidden state of {batch}x{width} needs {} values, got {}",
                batch * width,
                data.len()
            );
        }
        Ok(Self { batch, width, data })
    }

    pub fn from_tensor<B: Backend>(tensor: Tensor<B, 2>) -> Result<Self> {
        let [batch, width] = tensor.dims();
        let data = tensor
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("failed to read hidden state: {e:?}"))?;
        Self::from_vec(batch, width, data)
    }

    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        Tensor::from_data(
            TensorData::new(self.data.clone(), [self.batch, self.width]),
            device,
        )
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Selects actor rows in the given order.
    pub fn gather_rows(&self, rows: &[usize]) -> Self {
        let mut data = Vec::with_capacity(rows.len() * self.width);
        for &row in rows {
            data.extend_from_slice(&self.data[row * self.width..(row + 1) * self.width]);
        }
        Self {
            batch: rows.len(),
            width: self.width,
            data,
        }
    }
}

/// Zeroes rows of `hidden` where `resets` is 1.0.
pub fn reset_finished<B: Backend>(hidden: Tensor<B, 2>, resets: Tensor<B, 1>) -> Tensor<B, 2> {
    let [batch, width] = hidden.dims();
    let keep = resets.neg().add_scalar(1.0).reshape([batch, 1]).repeat_dim(1, width);
    hidden * keep
}

/// GRU cell: r/z gates, candidate `n = tanh(W_in x + r * (W_hn h))`,
/// `h' = (1 - z) * n + z * h`.
#[derive(Module, Debug)]
pub struct GruCell<B: Backend> {
    reset_input: Linear<B>,
    reset_hidden: Linear<B>,
    update_input: Linear<B>,
    update_hidden: Linear<B>,
    candidate_input: Linear<B>,
    candidate_hidden: Linear<B>,
}

impl<B: Backend> GruCell<B> {
    pub fn new(d_input: usize, d_hidden: usize, rng: &mut StdRng, device: &B::Device) -> Self {
        let mut layer = |d_in: usize| orthogonal_linear(d_in, d_hidden, 1.0, rng, device);
        Self {
            reset_input: layer(d_input),
            reset_hidden: layer(d_hidden),
            update_input: layer(d_input),
            update_hidden: layer(d_hidden),
            candidate_input: layer(d_input),
            candidate_hidden: layer(d_hidden),
        }
    }

    pub fn d_hidden(&self) -> usize {
        self.reset_hidden.weight.val().dims()[1]
    }

    pub fn step(&self, input: Tensor<B, 2>, hidden: Tensor<B, 2>) -> Tensor<B, 2> {
        let r = sigmoid(
            self.reset_input.forward(input.clone()) + self.reset_hidden.forward(hidden.clone()),
        );
        let z = sigmoid(
            self.update_input.forward(input.clone()) + self.update_hidden.forward(hidden.clone()),
        );
        let n = (self.candidate_input.forward(input)
            + r * self.candidate_hidden.forward(hidden.clone()))
        .tanh();

        let one_minus_z = z.clone().neg().add_scalar(1.0);
        one_minus_z * n + z * hidden
    }
}
