use burn::tensor::activation::{log_softmax, softmax};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

pub fn logprob_and_entropy<Bk: Backend>(
    logits: Tensor<Bk, 2>,
    actions: Tensor<Bk, 1, Int>,
) -> (Tensor<Bk, 1>, Tensor<Bk, 1>) {
    let lp = log_softmax(logits.clone(), 1);
    let probs = softmax(logits, 1);

    let bsz = actions.dims()[0];
    let idx2 = actions.reshape([bsz, 1]);
    let chosen_lp = lp.clone().gather(1, idx2).reshape([bsz]);

    let ent = (probs * lp).sum_dim(1).neg().reshape([bsz]);

    (chosen_lp, ent)
}

/// Sum of `x` over live steps divided by `max(count, 1)`; the count is known
/// on the host. Masked steps are zeroed whatever they hold, NaN included.
pub fn masked_mean<Bk: Backend>(x: Tensor<Bk, 1>, mask: Tensor<Bk, 1>, count: f32) -> Tensor<Bk, 1> {
    x.mask_fill(mask.equal_elem(0.0), 0.0)
        .sum()
        .div_scalar(count.max(1.0))
}

#[derive(Clone, Copy, Debug)]
pub struct PpoLossConfig {
    pub clip_eps: f32,
    pub vf_coef: f32,
    pub ent_coef: f32,
    pub clip_value_loss: bool,
}

pub struct PpoLossParts<Bk: Backend> {
    pub actor_loss: Tensor<Bk, 1>,
    pub value_loss: Tensor<Bk, 1>,
    pub entropy_mean: Tensor<Bk, 1>,
    pub approx_kl: Tensor<Bk, 1>,
    pub clip_fraction: Tensor<Bk, 1>,
    pub total_loss: Tensor<Bk, 1>,
}

/// Clipped surrogate, clipped value loss and entropy bonus, each a masked
/// mean over live (not done) steps.
///
/// `adv_t` is expected to be standardized already.
#[allow(clippy::too_many_arguments)]
pub fn compute_ppo_losses<Bk: Backend>(
    new_lp: Tensor<Bk, 1>,
    old_lp_t: Tensor<Bk, 1>,
    adv_t: Tensor<Bk, 1>,
    ent: Tensor<Bk, 1>,
    v: Tensor<Bk, 1>,
    old_v_t: Tensor<Bk, 1>,
    tgt_t: Tensor<Bk, 1>,
    mask_t: Tensor<Bk, 1>,
    live_count: f32,
    cfg: PpoLossConfig,
) -> PpoLossParts<Bk> {
    let clip_eps = cfg.clip_eps;
    let log_ratio = new_lp - old_lp_t;
    let ratio = log_ratio.clone().exp();
    let clipped = ratio.clone().clamp(1.0 - clip_eps, 1.0 + clip_eps);

    let surr1 = ratio.clone() * adv_t.clone();
    let surr2 = clipped * adv_t;

    let min_surr = (surr1.clone() + surr2.clone() - (surr1 - surr2).abs()) * 0.5;
    let actor_loss = masked_mean(min_surr, mask_t.clone(), live_count).neg();

    let entropy_mean = masked_mean(ent, mask_t.clone(), live_count);

    let l1 = (v.clone() - tgt_t.clone()).powf_scalar(2.0);
    let value_error = if cfg.clip_value_loss {
        let v_clipped = old_v_t.clone() + (v - old_v_t).clamp(-clip_eps, clip_eps);
        let l2 = (v_clipped - tgt_t).powf_scalar(2.0);
        (l1.clone() + l2.clone() + (l1 - l2).abs()) * 0.5
    } else {
        l1
    };
    let value_loss = masked_mean(value_error, mask_t.clone(), live_count) * 0.5;

    let ratio_detached = ratio.detach();
    let approx_kl = masked_mean(
        ratio_detached.clone().sub_scalar(1.0) - log_ratio.detach(),
        mask_t.clone(),
        live_count,
    );
    let clip_fraction = masked_mean(
        ratio_detached.sub_scalar(1.0).abs().greater_elem(clip_eps).float(),
        mask_t,
        live_count,
    );

    let total_loss = actor_loss.clone() + value_loss.clone() * cfg.vf_coef
        - entropy_mean.clone() * cfg.ent_coef;

    PpoLossParts {
        actor_loss,
        value_loss,
        entropy_mean,
        approx_kl,
        clip_fraction,
        total_loss,
    }
}
