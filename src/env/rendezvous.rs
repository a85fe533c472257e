use anyhow::{bail, Result};
use clap::ValueEnum;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use std::str::FromStr;

use super::{AgentMap, Diagnostics, Dones, EnvStep, MultiAgentEnv};

/// Unit moves for the discrete action set: stay, +x, -x, +y, -y.
const MOVES: [[f32; 2]; 5] = [[0.0, 0.0], [1.0, 0.0], [-1.0, 0.0], [0.0, 1.0], [0.0, -1.0]];

#[derive(Copy, Clone, Debug, ValueEnum, Eq, PartialEq)]
pub enum RewardMode {
    /// Dense reward for staying close to the origin.
    Distance,
    /// Reward for reducing the distance to the origin this step.
    Progress,
    /// 1.0 on the step the team reaches the goal, 0.0 otherwise.
    Sparse,
}

impl FromStr for RewardMode {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "distance" => Ok(Self::Distance),
            "progress" => Ok(Self::Progress),
            "sparse" => Ok(Self::Sparse),
            other => bail!("unknown reward mode {other:?} (expected distance, progress or sparse)"),
        }
    }
}

type RewardFn = fn(&RendezvousConfig, f32, f32, bool) -> f32;

impl RewardMode {
    fn resolve(self) -> RewardFn {
        match self {
            Self::Distance => distance_reward,
            Self::Progress => progress_reward,
            Self::Sparse => sparse_reward,
        }
    }
}

fn distance_reward(cfg: &RendezvousConfig, _prev: f32, next: f32, _won: bool) -> f32 {
    ((cfg.bound - next) / cfg.bound).max(0.0)
}

fn progress_reward(cfg: &RendezvousConfig, prev: f32, next: f32, _won: bool) -> f32 {
    (prev - next) / cfg.bound
}

fn sparse_reward(_cfg: &RendezvousConfig, _prev: f32, _next: f32, won: bool) -> f32 {
    if won {
        1.0
    } else {
        0.0
    }
}

/// Immutable parameters of the rendezvous task.
#[derive(Clone, Debug, PartialEq)]
pub struct RendezvousConfig {
    pub num_agents: usize,
    pub max_steps: u32,
    pub dt: f32,
    pub speed: f32,
    /// Outward drift rate; positions grow as `x += dt * drift * x` without control.
    pub drift: f32,
    pub noise: f32,
    /// Agents leaving the box `[-bound, bound]^2` are terminated.
    pub bound: f32,
    pub goal_radius: f32,
    pub reward_mode: RewardMode,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            num_agents: 2,
            max_steps: 100,
            dt: 0.1,
            speed: 1.0,
            drift: 0.5,
            noise: 0.02,
            bound: 2.0,
            goal_radius: 0.25,
            reward_mode: RewardMode::Distance,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RendezvousState {
    /// `[agent, 2]` positions.
    pub positions: Vec<f32>,
    pub agent_done: Vec<bool>,
    pub t: u32,
}

/// Agents steer a drifting point each towards the origin; the episode is won
/// once every live agent is inside the goal radius.
#[derive(Clone, Debug)]
pub struct RendezvousEnv {
    cfg: RendezvousConfig,
    agents: Vec<String>,
    reward_fn: RewardFn,
}

impl RendezvousEnv {
    pub fn new(cfg: RendezvousConfig) -> Result<Self> {
        if cfg.num_agents == 0 {
            bail!("rendezvous needs at least one agent");
        }
        if cfg.bound <= 0.0 || cfg.goal_radius <= 0.0 || cfg.dt <= 0.0 {
            bail!("rendezvous bound, goal_radius and dt must be positive");
        }
        let agents = (0..cfg.num_agents).map(|i| format!("agent_{i}")).collect();
        let reward_fn = cfg.reward_mode.resolve();
        Ok(Self {
            cfg,
            agents,
            reward_fn,
        })
    }

    fn observe(&self, state: &RendezvousState) -> AgentMap<Vec<f32>> {
        let n = self.cfg.num_agents;
        let time_frac = state.t as f32 / self.cfg.max_steps.max(1) as f32;
        self.agents
            .iter()
            .enumerate()
            .map(|(i, agent)| {
                let mut obs = vec![0.0f32; self.obs_dim()];
                obs[i] = 1.0;
                obs[n] = state.positions[2 * i] / self.cfg.bound;
                obs[n + 1] = state.positions[2 * i + 1] / self.cfg.bound;
                for (j, p) in state.positions.iter().enumerate() {
                    obs[n + 2 + j] = p / self.cfg.bound;
                }
                obs[3 * n + 2] = time_frac;
                (agent.clone(), obs)
            })
            .collect()
    }
}

fn radius(positions: &[f32], agent: usize) -> f32 {
    let x = positions[2 * agent];
    let y = positions[2 * agent + 1];
    (x * x + y * y).sqrt()
}

impl MultiAgentEnv for RendezvousEnv {
    type State = RendezvousState;

    fn agents(&self) -> &[String] {
        &self.agents
    }

    /// Agent one-hot, own position, every position, elapsed time fraction.
    fn obs_dim(&self) -> usize {
        3 * self.cfg.num_agents + 3
    }

    fn num_actions(&self) -> usize {
        MOVES.len()
    }

    fn reset(&self, rng: &mut StdRng) -> (AgentMap<Vec<f32>>, RendezvousState) {
        let half = 0.5 * self.cfg.bound;
        let positions = (0..2 * self.cfg.num_agents)
            .map(|_| rng.random_range(-half..half))
            .collect();
        let state = RendezvousState {
            positions,
            agent_done: vec![false; self.cfg.num_agents],
            t: 0,
        };
        (self.observe(&state), state)
    }

    fn step(
        &self,
        rng: &mut StdRng,
        state: &RendezvousState,
        actions: &AgentMap<usize>,
    ) -> Result<EnvStep<RendezvousState>> {
        for (agent, action) in actions {
            if !self.agents.contains(agent) {
                bail!("unknown agent {agent:?} in joint action");
            }
            if *action >= MOVES.len() {
                bail!("action {action} out of range for agent {agent}");
            }
        }

        let cfg = &self.cfg;
        let mut next = state.clone();
        next.t += 1;
        let noise_scale = cfg.noise * cfg.dt.sqrt();
        for (i, agent) in self.agents.iter().enumerate() {
            if state.agent_done[i] {
                continue;
            }
            let Some(&action) = actions.get(agent) else {
                bail!("missing action for agent {agent}");
            };
            for axis in 0..2 {
                let p = state.positions[2 * i + axis];
                let w: f32 = rng.sample(StandardNormal);
                next.positions[2 * i + axis] =
                    p + cfg.dt * (cfg.speed * MOVES[action][axis] + cfg.drift * p) + noise_scale * w;
            }
        }

        let live = (0..cfg.num_agents).filter(|i| !state.agent_done[*i]);
        let won = live.clone().count() > 0
            && live.clone().all(|i| radius(&next.positions, i) <= cfg.goal_radius);

        let mut reward = AgentMap::new();
        let mut agent_dones = AgentMap::new();
        for (i, agent) in self.agents.iter().enumerate() {
            let r = if state.agent_done[i] {
                0.0
            } else {
                let out_of_bounds = next.positions[2 * i].abs() > cfg.bound
                    || next.positions[2 * i + 1].abs() > cfg.bound;
                next.agent_done[i] = out_of_bounds;
                (self.reward_fn)(cfg, radius(&state.positions, i), radius(&next.positions, i), won)
            };
            reward.insert(agent.clone(), r);
        }

        let all = won || next.t >= cfg.max_steps || next.agent_done.iter().all(|d| *d);
        if all {
            next.agent_done.iter_mut().for_each(|d| *d = true);
        }
        for (i, agent) in self.agents.iter().enumerate() {
            agent_dones.insert(agent.clone(), next.agent_done[i]);
        }

        let mut info = Diagnostics::new();
        info.insert("won".to_string(), if won { 1.0 } else { 0.0 });

        Ok(EnvStep {
            obs: self.observe(&next),
            state: next,
            reward,
            done: Dones {
                agents: agent_dones,
                all,
            },
            info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn joint(env: &RendezvousEnv, action: usize) -> AgentMap<usize> {
        env.agents().iter().map(|a| (a.clone(), action)).collect()
    }

    #[test]
    fn reward_mode_parses_known_names() {
        assert_eq!("Progress".parse::<RewardMode>().unwrap(), RewardMode::Progress);
        assert!("shaped".parse::<RewardMode>().is_err());
    }

    #[test]
    fn observation_layout_matches_obs_dim() {
        let env = RendezvousEnv::new(RendezvousConfig {
            num_agents: 3,
            ..RendezvousConfig::default()
        })
        .unwrap();
        let (obs, state) = env.reset(&mut StdRng::seed_from_u64(0));

        assert_eq!(obs.len(), 3);
        let first = &obs["agent_0"];
        assert_eq!(first.len(), env.obs_dim());
        assert_eq!(first[0], 1.0);
        assert_eq!(first[3], state.positions[0] / 2.0);
    }

    #[test]
    fn step_is_pure() {
        let env = RendezvousEnv::new(RendezvousConfig::default()).unwrap();
        let (_, state) = env.reset(&mut StdRng::seed_from_u64(5));
        let snapshot = state.clone();

        let a = env
            .step(&mut StdRng::seed_from_u64(9), &state, &joint(&env, 1))
            .unwrap();
        let b = env
            .step(&mut StdRng::seed_from_u64(9), &state, &joint(&env, 1))
            .unwrap();

        assert_eq!(state, snapshot);
        assert_eq!(a.state, b.state);
        assert_eq!(a.state.t, 1);
    }

    #[test]
    fn unknown_agent_is_rejected() {
        let env = RendezvousEnv::new(RendezvousConfig::default()).unwrap();
        let (_, state) = env.reset(&mut StdRng::seed_from_u64(5));
        let mut actions = joint(&env, 0);
        actions.insert("ghost".to_string(), 0);

        assert!(env
            .step(&mut StdRng::seed_from_u64(1), &state, &actions)
            .is_err());
    }

    #[test]
    fn episode_ends_at_max_steps() {
        let env = RendezvousEnv::new(RendezvousConfig {
            max_steps: 2,
            noise: 0.0,
            drift: 0.0,
            ..RendezvousConfig::default()
        })
        .unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let state = RendezvousState {
            positions: vec![1.0, 1.0, -1.0, -1.0],
            agent_done: vec![false, false],
            t: 0,
        };

        let first = env.step(&mut rng, &state, &joint(&env, 0)).unwrap();
        assert!(!first.done.all);
        let second = env.step(&mut rng, &first.state, &joint(&env, 0)).unwrap();
        assert!(second.done.all);
        assert!(second.done.agents.values().all(|d| *d));
    }

    #[test]
    fn sparse_reward_pays_on_win() {
        let env = RendezvousEnv::new(RendezvousConfig {
            reward_mode: RewardMode::Sparse,
            noise: 0.0,
            drift: 0.0,
            ..RendezvousConfig::default()
        })
        .unwrap();
        let state = RendezvousState {
            positions: vec![0.01, 0.0, 0.0, 0.01],
            agent_done: vec![false, false],
            t: 0,
        };

        let step = env
            .step(&mut StdRng::seed_from_u64(0), &state, &joint(&env, 0))
            .unwrap();
        assert!(step.done.all);
        assert_eq!(step.info["won"], 1.0);
        assert!(step.reward.values().all(|r| *r == 1.0));
    }
}
