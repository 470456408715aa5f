//! Live agents of a LocalRP session

use chrono::{DateTime, Utc};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use veil_io::VirtualHandle;

/// One registered reverse-proxy agent
#[derive(Debug, Clone)]
pub struct TunnelAgent {
    pub id: u64,
    pub addr: SocketAddr,
    /// Local side of the virtual connection bridged to the agent socket
    pub endpoint: Arc<VirtualHandle>,
    pub connected_at: DateTime<Utc>,
}

/// Agents in registration order; removal swaps the last agent into the gap
#[derive(Debug, Default)]
pub struct AgentSet {
    agents: Vec<TunnelAgent>,
}

impl AgentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, agent: TunnelAgent) {
        self.agents.push(agent);
    }

    /// Remove an agent by id
    pub fn remove(&mut self, id: u64) -> Option<TunnelAgent> {
        let index = self.agents.iter().position(|a| a.id == id)?;
        Some(self.agents.swap_remove(index))
    }

    /// Pick an agent uniformly at random
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&TunnelAgent> {
        if self.agents.is_empty() {
            return None;
        }
        let index = rng.gen_range(0..self.agents.len());
        self.agents.get(index)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_io::virtual_pair;

    fn agent(id: u64) -> TunnelAgent {
        let (handle, _conn) = virtual_pair();
        TunnelAgent {
            id,
            addr: "127.0.0.1:9000".parse().unwrap(),
            endpoint: Arc::new(handle),
            connected_at: Utc::now(),
        }
    }

    #[test]
    fn test_remove_swaps_last() {
        let mut set = AgentSet::new();
        set.push(agent(1));
        set.push(agent(2));
        set.push(agent(3));

        assert_eq!(set.remove(1).map(|a| a.id), Some(1));
        assert_eq!(set.len(), 2);
        assert!(set.remove(1).is_none());
        assert_eq!(set.agents[0].id, 3);
    }

    #[test]
    fn test_pick_covers_all_agents() {
        let mut set = AgentSet::new();
        set.push(agent(1));
        set.push(agent(2));

        let mut rng = rand::thread_rng();
        let mut seen = [0usize; 2];
        for _ in 0..200 {
            let id = set.pick(&mut rng).unwrap().id;
            seen[(id - 1) as usize] += 1;
        }
        assert!(seen[0] > 0 && seen[1] > 0);
    }

    #[test]
    fn test_pick_empty() {
        let set = AgentSet::new();
        assert!(set.pick(&mut rand::thread_rng()).is_none());
        assert!(set.is_empty());
    }
}
