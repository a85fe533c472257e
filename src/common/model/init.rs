use burn::module::Param;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

/// Row-major `[rows, cols]` matrix with orthonormal columns (or rows, when
/// `rows < cols`), scaled by `gain`.
///
/// Built by Gram-Schmidt over Gaussian draws on the host so that parameter
/// init depends only on `rng`, not on the backend's generator.
pub fn orthogonal_weights(rows: usize, cols: usize, gain: f32, rng: &mut StdRng) -> Vec<f32> {
    let tall = rows.max(cols);
    let short = rows.min(cols);

    let mut basis: Vec<Vec<f64>> = Vec::with_capacity(short);
    while basis.len() < short {
        let mut v: Vec<f64> = (0..tall).map(|_| rng.sample(StandardNormal)).collect();
        // two passes keep the basis orthogonal to working precision
        for _ in 0..2 {
            for u in &basis {
                let d = dot(&v, u);
                for (vi, ui) in v.iter_mut().zip(u) {
                    *vi -= d * ui;
                }
            }
        }
        let norm = dot(&v, &v).sqrt();
        if norm < 1.0e-8 {
            continue;
        }
        v.iter_mut().for_each(|x| *x /= norm);
        basis.push(v);
    }

    let mut out = vec![0.0f32; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            let value = if rows >= cols { basis[c][r] } else { basis[r][c] };
            out[r * cols + c] = gain * value as f32;
        }
    }
    out
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Dense layer with orthogonal weights and zero bias.
pub fn orthogonal_linear<B: Backend>(
    d_input: usize,
    d_output: usize,
    gain: f32,
    rng: &mut StdRng,
    device: &B::Device,
) -> Linear<B> {
    let mut linear = LinearConfig::new(d_input, d_output).init(device);
    let weights = orthogonal_weights(d_input, d_output, gain, rng);
    linear.weight = Param::from_tensor(Tensor::from_data(
        TensorData::new(weights, [d_input, d_output]),
        device,
    ));
    linear.bias = Some(Param::from_tensor(Tensor::zeros([d_output], device)));
    linear
}
