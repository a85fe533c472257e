use anyhow::Result;
use rand::rngs::StdRng;

use super::{AgentMap, Diagnostics, EnvStep, MultiAgentEnv};

pub const RETURNED_EPISODE: &str = "returned_episode";
pub const RETURNED_EPISODE_RETURNS: &str = "returned_episode_returns";
pub const RETURNED_EPISODE_LENGTHS: &str = "returned_episode_lengths";
pub const RETURNED_WON_EPISODE: &str = "returned_won_episode";

#[derive(Clone, Debug, PartialEq)]
pub struct LogState<S> {
    pub inner: S,
    pub episode_return: f32,
    pub episode_length: u32,
    pub returned_episode_return: f32,
    pub returned_episode_length: u32,
    pub returned_won: f32,
}

/// Tracks the team return (mean reward over agents, summed over time) of the
/// running episode and publishes the last finished episode in diagnostics.
#[derive(Clone, Debug)]
pub struct LogWrapper<E> {
    inner: E,
}

impl<E: MultiAgentEnv> LogWrapper<E> {
    pub fn new(inner: E) -> Self {
        Self { inner }
    }

}

impl<E: MultiAgentEnv> MultiAgentEnv for LogWrapper<E> {
    type State = LogState<E::State>;

    fn agents(&self) -> &[String] {
        self.inner.agents()
    }

    fn obs_dim(&self) -> usize {
        self.inner.obs_dim()
    }

    fn num_actions(&self) -> usize {
        self.inner.num_actions()
    }

    fn reset(&self, rng: &mut StdRng) -> (AgentMap<Vec<f32>>, Self::State) {
        let (obs, inner) = self.inner.reset(rng);
        let state = LogState {
            inner,
            episode_return: 0.0,
            episode_length: 0,
            returned_episode_return: 0.0,
            returned_episode_length: 0,
            returned_won: 0.0,
        };
        (obs, state)
    }

    fn step(
        &self,
        rng: &mut StdRng,
        state: &Self::State,
        actions: &AgentMap<usize>,
    ) -> Result<EnvStep<Self::State>> {
        let step = self.inner.step(rng, &state.inner, actions)?;

        let team_reward =
            step.reward.values().sum::<f32>() / self.inner.num_agents().max(1) as f32;
        let episode_return = state.episode_return + team_reward;
        let episode_length = state.episode_length + 1;
        let finished = step.done.all;
        let won = step.info.get("won").copied().unwrap_or(0.0);

        let next = LogState {
            inner: step.state,
            episode_return: if finished { 0.0 } else { episode_return },
            episode_length: if finished { 0 } else { episode_length },
            returned_episode_return: if finished {
                episode_return
            } else {
                state.returned_episode_return
            },
            returned_episode_length: if finished {
                episode_length
            } else {
                state.returned_episode_length
            },
            returned_won: if finished { won } else { state.returned_won },
        };

        let mut info: Diagnostics = step.info;
        info.insert(RETURNED_EPISODE.to_string(), if finished { 1.0 } else { 0.0 });
        info.insert(
            RETURNED_EPISODE_RETURNS.to_string(),
            next.returned_episode_return,
        );
        info.insert(
            RETURNED_EPISODE_LENGTHS.to_string(),
            next.returned_episode_length as f32,
        );
        info.insert(RETURNED_WON_EPISODE.to_string(), next.returned_won);

        Ok(EnvStep {
            obs: step.obs,
            state: next,
            reward: step.reward,
            done: step.done,
            info,
        })
    }
}
