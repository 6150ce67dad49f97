//! Running statistics of the episodes of a pool.
use ndarray::Array1;

/// Statistics of the running episode of every environment.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeStats {
    /// Sum of rewards.
    pub returns: Array1<f64>,

    /// The task succeeded at least once.
    pub success_once: Array1<bool>,

    /// Number of rewarded cycles.
    pub episode_len: Array1<usize>,
}

impl EpisodeStats {
    /// Mean reward per cycle of each episode, 0 for episodes without cycles.
    pub fn mean_reward(&self) -> Array1<f64> {
        self.returns
            .iter()
            .zip(self.episode_len.iter())
            .map(|(&r, &n)| if n == 0 { 0.0 } else { r / n as f64 })
            .collect()
    }
}

/// Accumulates [`EpisodeStats`].
#[derive(Debug, Clone)]
pub struct EpisodeTracker {
    stats: EpisodeStats,

    /// Episodes that ended in the last update; their worker already started a new one.
    ended: Vec<bool>,
}

impl EpisodeTracker {
    /// Creates a tracker of `n` environments.
    pub fn new(n: usize) -> Self {
        Self {
            stats: EpisodeStats {
                returns: Array1::zeros(n),
                success_once: Array1::from_elem(n, false),
                episode_len: Array1::zeros(n),
            },
            ended: vec![false; n],
        }
    }

    /// Adds one cycle of rewards and returns the updated statistics.
    pub fn update(&mut self, rewards: &[f64], terminated: &[bool]) -> EpisodeStats {
        for i in 0..self.ended.len() {
            if self.ended[i] {
                self.zero(i);
            }
            self.stats.returns[i] += rewards[i];
            self.stats.episode_len[i] += 1;
            if rewards[i] > 0.0 {
                self.stats.success_once[i] = true;
            }
            self.ended[i] = terminated[i];
        }
        self.stats.clone()
    }

    /// Zeroes the statistics of the given environments.
    pub fn reset(&mut self, indices: &[usize]) {
        for &i in indices {
            self.zero(i);
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> &EpisodeStats {
        &self.stats
    }

    fn zero(&mut self, i: usize) {
        self.stats.returns[i] = 0.0;
        self.stats.success_once[i] = false;
        self.stats.episode_len[i] = 0;
        self.ended[i] = false;
    }
}
