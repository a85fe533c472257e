use anyhow::{bail, Result};

use crate::env::AgentMap;

/// Agent-major stack of per-agent arrays: `[agent, env, width]`, flattened.
///
/// Row `agent * num_envs + env` is the actor index used everywhere in the
/// trainer, so `data` can be handed to the network as `[num_actors, width]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Stacked<T> {
    pub num_agents: usize,
    pub num_envs: usize,
    pub width: usize,
    pub data: Vec<T>,
}

impl<T: Clone> Stacked<T> {
    pub fn num_actors(&self) -> usize {
        self.num_agents * self.num_envs
    }

    /// Splits the environment axis into `num_shards` equal contiguous groups.
    pub fn split_envs(&self, num_shards: usize) -> Result<Vec<Stacked<T>>> {
        if num_shards == 0 || self.num_envs % num_shards != 0 {
            bail!(
                "cannot split {} environments into {num_shards} equal shards",
                self.num_envs
            );
        }
        let per_shard = self.num_envs / num_shards;
        let shards = (0..num_shards)
            .map(|shard| {
                let mut data = Vec::with_capacity(self.num_agents * per_shard * self.width);
                for agent in 0..self.num_agents {
                    let start = (agent * self.num_envs + shard * per_shard) * self.width;
                    data.extend_from_slice(&self.data[start..start + per_shard * self.width]);
                }
                Stacked {
                    num_agents: self.num_agents,
                    num_envs: per_shard,
                    width: self.width,
                    data,
                }
            })
            .collect();
        Ok(shards)
    }
}

/// Stacks a per-agent map into `[agent, env, width]` following `agents` order.
///
/// Every array must hold `num_envs * width` values for a shared `width`, and
/// the map keys must be exactly `agents`.
pub fn batchify<T: Clone>(
    per_agent: &AgentMap<Vec<T>>,
    agents: &[String],
    num_envs: usize,
) -> Result<Stacked<T>> {
    if num_envs == 0 {
        bail!("batchify needs at least one environment");
    }
    if let Some(unknown) = per_agent.keys().find(|k| !agents.contains(k)) {
        bail!("unknown agent {unknown:?} in per-agent map");
    }

    let mut width = None;
    let mut data = Vec::new();
    for agent in agents {
        let Some(values) = per_agent.get(agent) else {
            bail!("missing agent {agent:?} in per-agent map");
        };
        if values.len() % num_envs != 0 {
            bail!(
                "agent {agent:?} has {} values, not a multiple of {num_envs} environments",
                values.len()
            );
        }
        let w = values.len() / num_envs;
        match width {
            None => {
                width = Some(w);
                data.reserve(agents.len() * values.len());
            }
            Some(expected) if expected != w => {
                bail!("agent {agent:?} has width {w}, expected {expected}");
            }
            Some(_) => {}
        }
        data.extend_from_slice(values);
    }

    Ok(Stacked {
        num_agents: agents.len(),
        num_envs,
        width: width.unwrap_or(0),
        data,
    })
}

pub fn unbatchify<T: Clone>(stacked: &Stacked<T>, agents: &[String]) -> Result<AgentMap<Vec<T>>> {
    if agents.len() != stacked.num_agents {
        bail!(
            "stacked batch has {} agents, got {} names",
            stacked.num_agents,
            agents.len()
        );
    }
    let expected = stacked.num_agents * stacked.num_envs * stacked.width;
    if stacked.data.len() != expected {
        bail!(
            "stacked batch holds {} values, expected {expected}",
            stacked.data.len()
        );
    }
    let chunk = stacked.num_envs * stacked.width;
    Ok(agents
        .iter()
        .enumerate()
        .map(|(i, agent)| (agent.clone(), stacked.data[i * chunk..(i + 1) * chunk].to_vec()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agents() -> Vec<String> {
        vec!["agent_0".to_string(), "agent_1".to_string()]
    }

    fn sample() -> AgentMap<Vec<f32>> {
        let mut map = AgentMap::new();
        map.insert("agent_0".to_string(), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        map.insert("agent_1".to_string(), vec![10.0, 11.0, 12.0, 13.0, 14.0, 15.0]);
        map
    }

    #[test]
    fn batchify_is_agent_major() {
        let stacked = batchify(&sample(), &agents(), 3).unwrap();

        assert_eq!(stacked.num_agents, 2);
        assert_eq!(stacked.num_envs, 3);
        assert_eq!(stacked.width, 2);
        assert_eq!(&stacked.data[8..10], &[12.0, 13.0]);
    }

    #[test]
    fn unbatchify_inverts_batchify() {
        let original = sample();
        let stacked = batchify(&original, &agents(), 3).unwrap();

        assert_eq!(unbatchify(&stacked, &agents()).unwrap(), original);
    }

    #[test]
    fn unknown_and_missing_agents_are_rejected() {
        let mut extra = sample();
        extra.insert("agent_9".to_string(), vec![0.0; 6]);
        assert!(batchify(&extra, &agents(), 3).is_err());

        let mut missing = sample();
        missing.remove("agent_1");
        assert!(batchify(&missing, &agents(), 3).is_err());
    }

    #[test]
    fn ragged_arrays_are_rejected() {
        let mut ragged = sample();
        ragged.insert("agent_1".to_string(), vec![0.0; 9]);
        assert!(batchify(&ragged, &agents(), 3).is_err());
        assert!(batchify(&sample(), &agents(), 4).is_err());
    }

    #[test]
    fn env_shards_are_contiguous() {
        let stacked = batchify(&sample(), &agents(), 3).unwrap();
        assert!(stacked.split_envs(2).is_err());

        let shards = stacked.split_envs(3).unwrap();
        assert_eq!(shards.len(), 3);
        assert_eq!(shards[1].data, vec![2.0, 3.0, 12.0, 13.0]);
    }
}
