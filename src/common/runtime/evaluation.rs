use anyhow::{bail, Result};

use crate::env::log_wrapper::{RETURNED_EPISODE, RETURNED_EPISODE_RETURNS, RETURNED_WON_EPISODE};
use crate::env::Diagnostics;

/// Episode outcomes gathered from diagnostics over a rollout.
///
/// Kept as sums so replicas can add their shards before taking ratios.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpisodeStats {
    pub episodes: f32,
    pub return_sum: f32,
    pub wins: f32,
    pub env_steps: f32,
}

impl EpisodeStats {
    pub fn record_step(&mut self, infos: &[Diagnostics]) {
        self.env_steps += infos.len() as f32;
        for info in infos {
            let finished = info.get(RETURNED_EPISODE).copied().unwrap_or(0.0);
            if finished < 0.5 {
                continue;
            }
            self.episodes += 1.0;
            self.return_sum += info.get(RETURNED_EPISODE_RETURNS).copied().unwrap_or(0.0);
            self.wins += info.get(RETURNED_WON_EPISODE).copied().unwrap_or(0.0);
        }
    }

    pub fn mean_return(&self) -> f32 {
        if self.episodes > 0.0 {
            self.return_sum / self.episodes
        } else {
            0.0
        }
    }

    pub fn win_rate(&self) -> f32 {
        if self.episodes > 0.0 {
            self.wins / self.episodes
        } else {
            0.0
        }
    }

    pub fn to_vec(&self) -> Vec<f32> {
        vec![self.episodes, self.return_sum, self.wins, self.env_steps]
    }

    pub fn from_slice(values: &[f32]) -> Result<Self> {
        let [episodes, return_sum, wins, env_steps] = values else {
            bail!("episode stats need 4 values, got {}", values.len());
        };
        Ok(Self {
            episodes: *episodes,
            return_sum: *return_sum,
            wins: *wins,
            env_steps: *env_steps,
        })
    }
}
