use burn::module::Module;
use burn::nn::Linear;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::init::orthogonal_linear;
use super::rnn::{reset_finished, GruCell, HiddenState};

#[derive(Clone, Debug, PartialEq)]
pub struct ActorCriticConfig {
    pub obs_dim: usize,
    pub num_actions: usize,
    pub hidden_dim: usize,
    pub fc_dim: usize,
    pub seed: u64,
}

pub struct RnnOutput<B: Backend> {
    /// `[N, H]` carry after the last timestep.
    pub hidden: Tensor<B, 2>,
    /// `[T, N, A]`
    pub logits: Tensor<B, 3>,
    /// `[T, N]`
    pub values: Tensor<B, 2>,
}

/// Shared-parameter recurrent actor-critic: embedding, GRU, then separate
/// policy and value heads on the recurrent output.
#[derive(Module, Debug)]
pub struct ActorCriticRnn<B: Backend> {
    embed: Linear<B>,
    cell: GruCell<B>,
    actor_hidden: Linear<B>,
    actor_out: Linear<B>,
    critic_hidden: Linear<B>,
    critic_out: Linear<B>,
}

impl<B: Backend> ActorCriticRnn<B> {
    pub fn new(cfg: &ActorCriticConfig, device: &B::Device) -> Self {
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let sqrt2 = std::f32::consts::SQRT_2;

        let embed = orthogonal_linear(cfg.obs_dim, cfg.hidden_dim, sqrt2, &mut rng, device);
        let cell = GruCell::new(cfg.hidden_dim, cfg.hidden_dim, &mut rng, device);
        let actor_hidden = orthogonal_linear(cfg.hidden_dim, cfg.fc_dim, sqrt2, &mut rng, device);
        let actor_out = orthogonal_linear(cfg.fc_dim, cfg.num_actions, 0.01, &mut rng, device);
        let critic_hidden = orthogonal_linear(cfg.hidden_dim, cfg.fc_dim, sqrt2, &mut rng, device);
        let critic_out = orthogonal_linear(cfg.fc_dim, 1, 1.0, &mut rng, device);

        Self {
            embed,
            cell,
            actor_hidden,
            actor_out,
            critic_hidden,
            critic_out,
        }
    }

    pub fn hidden_dim(&self) -> usize {
        self.cell.d_hidden()
    }

    pub fn initial_hidden(&self, batch: usize) -> HiddenState {
        HiddenState::zeros(batch, self.hidden_dim())
    }

    /// Runs `T` steps for `N` actors. At each step rows whose reset flag is 1
    /// start from a zero carry before the cell update.
    pub fn forward(
        &self,
        hidden: Tensor<B, 2>,
        obs: Tensor<B, 3>,
        resets: Tensor<B, 2>,
    ) -> RnnOutput<B> {
        let [steps, actors, _] = obs.dims();
        let width = self.hidden_dim();
        let embedded = relu(self.embed.forward(obs));

        let mut h = hidden;
        let mut outputs = Vec::with_capacity(steps);
        for t in 0..steps {
            let x = embedded.clone().narrow(0, t, 1).reshape([actors, width]);
            let reset = resets.clone().narrow(0, t, 1).reshape([actors]);
            h = self.cell.step(x, reset_finished(h, reset));
            outputs.push(h.clone().reshape([1, actors, width]));
        }
        let rnn_out = Tensor::cat(outputs, 0);

        let logits = self
            .actor_out
            .forward(relu(self.actor_hidden.forward(rnn_out.clone())));
        let values = self
            .critic_out
            .forward(relu(self.critic_hidden.forward(rnn_out)))
            .reshape([steps, actors]);

        RnnOutput {
            hidden: h,
            logits,
            values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::{Distribution, TensorData};
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn config() -> ActorCriticConfig {
        ActorCriticConfig {
            obs_dim: 5,
            num_actions: 4,
            hidden_dim: 8,
            fc_dim: 6,
            seed: 3,
        }
    }

    fn values_of<const D: usize>(t: Tensor<TestBackend, D>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn forward_shapes() {
        let device = NdArrayDevice::Cpu;
        let model = ActorCriticRnn::<TestBackend>::new(&config(), &device);
        let obs = Tensor::<TestBackend, 3>::random([3, 2, 5], Distribution::Normal(0.0, 1.0), &device);
        let resets = Tensor::<TestBackend, 2>::zeros([3, 2], &device);

        let out = model.forward(model.initial_hidden(2).to_tensor(&device), obs, resets);
        assert_eq!(out.hidden.dims(), [2, 8]);
        assert_eq!(out.logits.dims(), [3, 2, 4]);
        assert_eq!(out.values.dims(), [3, 2]);
    }

    #[test]
    fn same_seed_builds_identical_parameters() {
        let device = NdArrayDevice::Cpu;
        let a = ActorCriticRnn::<TestBackend>::new(&config(), &device);
        let b = ActorCriticRnn::<TestBackend>::new(&config(), &device);
        let obs = Tensor::<TestBackend, 3>::ones([1, 1, 5], &device);
        let resets = Tensor::<TestBackend, 2>::zeros([1, 1], &device);
        let h = Tensor::<TestBackend, 2>::zeros([1, 8], &device);

        let out_a = a.forward(h.clone(), obs.clone(), resets.clone());
        let out_b = b.forward(h, obs, resets);
        assert_eq!(values_of(out_a.logits), values_of(out_b.logits));
        assert_eq!(values_of(out_a.values), values_of(out_b.values));
    }

    #[test]
    fn reset_flag_discards_incoming_carry() {
        let device = NdArrayDevice::Cpu;
        let model = ActorCriticRnn::<TestBackend>::new(&config(), &device);
        let obs = Tensor::<TestBackend, 3>::random([1, 2, 5], Distribution::Normal(0.0, 1.0), &device);
        let resets =
            Tensor::<TestBackend, 2>::from_data(TensorData::new(vec![1.0f32, 1.0], [1, 2]), &device);
        let noisy = Tensor::<TestBackend, 2>::random([2, 8], Distribution::Normal(0.0, 1.0), &device);
        let zeros = Tensor::<TestBackend, 2>::zeros([2, 8], &device);

        let from_noisy = model.forward(noisy, obs.clone(), resets.clone());
        let from_zeros = model.forward(zeros, obs, resets);
        assert_eq!(values_of(from_noisy.hidden), values_of(from_zeros.hidden));
    }

    #[test]
    fn policy_head_starts_near_uniform() {
        let device = NdArrayDevice::Cpu;
        let model = ActorCriticRnn::<TestBackend>::new(&config(), &device);
        let obs = Tensor::<TestBackend, 3>::random([2, 4, 5], Distribution::Normal(0.0, 1.0), &device);
        let resets = Tensor::<TestBackend, 2>::zeros([2, 4], &device);

        let out = model.forward(model.initial_hidden(4).to_tensor(&device), obs, resets);
        assert!(values_of(out.logits).iter().all(|l| l.abs() < 0.5));
    }
}
