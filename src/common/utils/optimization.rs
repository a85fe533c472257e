use anyhow::{bail, Result};
use burn::module::{AutodiffModule, Module, ModuleVisitor, Param};
use burn::optim::GradientsParams;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};

use crate::common::runtime::replica::{GradientSync, ReduceOp};

pub fn linear_decay_alpha(update: usize, num_updates: usize) -> f64 {
    if num_updates == 0 {
        return 1.0;
    }
    let progress = (update as f64) / (num_updates as f64);
    (1.0 - progress).max(0.0)
}

struct GradSqAccumulator<'a> {
    grads: &'a GradientsParams,
    sum_sq: f64,
}

impl<'a> GradSqAccumulator<'a> {
    fn new(grads: &'a GradientsParams) -> Self {
        Self { grads, sum_sq: 0.0 }
    }
}

impl<Bk: AutodiffBackend> ModuleVisitor<Bk> for GradSqAccumulator<'_> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<Bk, D>>) {
        let id = param.id;
        if let Some(grad) = self.grads.get::<Bk::InnerBackend, D>(id) {
            if let Ok(values) = grad.to_data().to_vec::<f32>() {
                self.sum_sq += values
                    .iter()
                    .map(|v| {
                        let x = (*v) as f64;
                        x * x
                    })
                    .sum::<f64>();
            }
        }
    }
}

struct GradScaler<'a> {
    grads: &'a mut GradientsParams,
    scale: f64,
}

impl<Bk: AutodiffBackend> ModuleVisitor<Bk> for GradScaler<'_> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<Bk, D>>) {
        let id = param.id;
        if let Some(grad) = self.grads.remove::<Bk::InnerBackend, D>(id) {
            self.grads
                .register::<Bk::InnerBackend, D>(id, grad.mul_scalar(self.scale));
        }
    }
}

/// Rescales all gradients so their joint L2 norm is at most `max_grad_norm`.
/// Returns the norm before clipping.
pub fn clip_global_grad_norm<Bk: AutodiffBackend, M: AutodiffModule<Bk>>(
    module: &M,
    grads: &mut GradientsParams,
    max_grad_norm: f32,
) -> f32 {
    let mut acc = GradSqAccumulator::new(grads);
    <M as Module<Bk>>::visit(module, &mut acc);

    let total_norm = acc.sum_sq.sqrt() as f32;
    if max_grad_norm > 0.0 && total_norm > max_grad_norm {
        let scale = (max_grad_norm / (total_norm + 1.0e-6)) as f64;
        let mut scaler = GradScaler { grads, scale };
        <M as Module<Bk>>::visit(module, &mut scaler);
    }

    total_norm
}

/// Concatenates gradients in parameter visit order; parameters without a
/// gradient contribute zeros so every replica produces the same layout.
struct GradFlattener<'a> {
    grads: &'a GradientsParams,
    values: Vec<f32>,
    failed: Option<String>,
}

impl<Bk: AutodiffBackend> ModuleVisitor<Bk> for GradFlattener<'_> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<Bk, D>>) {
        let numel = param.val().dims().iter().product::<usize>();
        match self.grads.get::<Bk::InnerBackend, D>(param.id) {
            Some(grad) => match grad.to_data().to_vec::<f32>() {
                Ok(values) => self.values.extend(values),
                Err(e) => self.failed = Some(format!("{e:?}")),
            },
            None => self.values.extend(std::iter::repeat_n(0.0, numel)),
        }
    }
}

struct GradScatter<'a> {
    grads: &'a mut GradientsParams,
    values: &'a [f32],
    cursor: usize,
}

impl<Bk: AutodiffBackend> ModuleVisitor<Bk> for GradScatter<'_> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<Bk, D>>) {
        let value = param.val();
        let dims = value.dims();
        let numel = dims.iter().product::<usize>();
        let chunk = self.values[self.cursor..self.cursor + numel].to_vec();
        self.cursor += numel;

        let grad = Tensor::<Bk::InnerBackend, D>::from_data(
            TensorData::new(chunk, dims),
            &value.device(),
        );
        self.grads.remove::<Bk::InnerBackend, D>(param.id);
        self.grads.register::<Bk::InnerBackend, D>(param.id, grad);
    }
}

struct ParamCounter {
    total: usize,
}

impl<Bk: AutodiffBackend> ModuleVisitor<Bk> for ParamCounter {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<Bk, D>>) {
        self.total += param.val().dims().iter().product::<usize>();
    }
}

pub fn num_params<Bk: AutodiffBackend, M: AutodiffModule<Bk>>(module: &M) -> usize {
    let mut counter = ParamCounter { total: 0 };
    <M as Module<Bk>>::visit(module, &mut counter);
    counter.total
}

struct ParamFlattener {
    values: Vec<f32>,
    failed: Option<String>,
}

impl<B: Backend> ModuleVisitor<B> for ParamFlattener {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        match param.val().into_data().to_vec::<f32>() {
            Ok(values) => self.values.extend(values),
            Err(e) => self.failed = Some(format!("{e:?}")),
        }
    }
}

/// All parameter values in visit order.
pub fn flatten_params<B: Backend, M: Module<B>>(module: &M) -> Result<Vec<f32>> {
    let mut flattener = ParamFlattener {
        values: Vec::new(),
        failed: None,
    };
    module.visit(&mut flattener);
    match flattener.failed {
        Some(reason) => bail!("failed to read parameters: {reason}"),
        None => Ok(flattener.values),
    }
}

/// Replaces local gradients by their mean over all replicas.
pub fn all_reduce_gradients<Bk: AutodiffBackend, M: AutodiffModule<Bk>>(
    module: &M,
    grads: GradientsParams,
    sync: &dyn GradientSync,
) -> Result<GradientsParams> {
    if sync.world_size() == 1 {
        return Ok(grads);
    }

    let mut flattener = GradFlattener {
        grads: &grads,
        values: Vec::new(),
        failed: None,
    };
    <M as Module<Bk>>::visit(module, &mut flattener);
    if let Some(reason) = flattener.failed {
        bail!("failed to read gradients: {reason}");
    }

    let reduced = sync.all_reduce(flattener.values, ReduceOp::Mean)?;
    if reduced.len() != num_params::<Bk, M>(module) {
        bail!(
            "reduced gradient has {} values, module has {}",
            reduced.len(),
            num_params::<Bk, M>(module)
        );
    }

    let mut grads = grads;
    let mut scatter = GradScatter {
        grads: &mut grads,
        values: &reduced,
        cursor: 0,
    };
    <M as Module<Bk>>::visit(module, &mut scatter);
    Ok(grads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::runtime::replica::SingleReplica;
    use burn::backend::autodiff::Autodiff;
    use burn::nn::{Linear, LinearConfig};
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn linear_and_grads() -> (Linear<TestBackend>, GradientsParams) {
        let device = NdArrayDevice::Cpu;
        let linear = LinearConfig::new(3, 2).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 2>::ones([4, 3], &device) * 10.0;
        let loss = linear.forward(x).sum();
        let grads = GradientsParams::from_grads(loss.backward(), &linear);
        (linear, grads)
    }

    #[test]
    fn clipping_bounds_the_global_norm() {
        let (linear, mut grads) = linear_and_grads();
        let before = clip_global_grad_norm::<TestBackend, _>(&linear, &mut grads, 0.1);
        assert!(before > 0.1);
        let after = clip_global_grad_norm::<TestBackend, _>(&linear, &mut grads, 0.1);
        assert!((after - 0.1).abs() < 1e-3);
    }

    #[test]
    fn single_replica_reduce_keeps_gradients() {
        let (linear, grads) = linear_and_grads();
        let mut grads = all_reduce_gradients::<TestBackend, _>(&linear, grads, &SingleReplica).unwrap();
        let norm = clip_global_grad_norm::<TestBackend, _>(&linear, &mut grads, 0.0);
        // d(sum)/dW = 40 for each of 6 weights, d/db = 4 for each of 2 biases
        let expected = (6.0f32 * 1600.0 + 2.0 * 16.0).sqrt();
        assert!((norm - expected).abs() < 1e-2);
        assert_eq!(
            flatten_params::<TestBackend, _>(&linear).unwrap().len(),
            num_params::<TestBackend, _>(&linear)
        );
    }

    #[test]
    fn decay_reaches_zero_at_the_end() {
        assert_eq!(linear_decay_alpha(0, 10), 1.0);
        assert!((linear_decay_alpha(5, 10) - 0.5).abs() < 1e-12);
        assert_eq!(linear_decay_alpha(10, 10), 0.0);
        assert_eq!(linear_decay_alpha(12, 10), 0.0);
        assert_eq!(linear_decay_alpha(3, 0), 1.0);
    }
}
