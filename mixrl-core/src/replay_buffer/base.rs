//! Episodic replay buffer.
use super::{EpisodeBatch, ReplayBufferConfig, RunningMeanStd, TransitionBatch};
use crate::error::MixrlError;
use anyhow::Result;
use log::trace;
use ndarray::{Array1, Array2, Array3};
use rand::{
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
    Rng, SeedableRng,
};
use std::collections::VecDeque;

/// Steps of a single episode, stored flat.
#[derive(Debug, Default, Clone)]
struct Episode {
    obs: Vec<f32>,
    state: Vec<f32>,
    ctl: Vec<u32>,
    rwd: Vec<f32>,
    done: Vec<f32>,
}

impl Episode {
    fn len(&self) -> usize {
        self.ctl.len()
    }

    fn is_empty(&self) -> bool {
        self.ctl.is_empty()
    }
}

/// Replay buffer storing whole episodes.
///
/// Each environment step is stored as `(obs, ctl, state, reward, done)`.
/// Episode boundaries are explicit: steps are appended to an open episode
/// until [`close_episode`](Self::close_episode) is called, and only closed
/// episodes are sampled. When the number of stored steps exceeds the
/// capacity the oldest episodes are evicted.
pub struct EpisodeReplayBuffer {
    obs_dim: usize,
    act_dim: usize,
    state_dim: usize,
    capacity: usize,
    episodes: VecDeque<Episode>,
    current: Episode,
    size: usize,
    obs_stats: RunningMeanStd,
    rng: StdRng,
}

impl EpisodeReplayBuffer {
    /// Constructs an empty buffer.
    pub fn build(
        config: &ReplayBufferConfig,
        obs_dim: usize,
        act_dim: usize,
        state_dim: usize,
    ) -> Self {
        Self {
            obs_dim,
            act_dim,
            state_dim,
            capacity: config.capacity,
            episodes: VecDeque::new(),
            current: Episode::default(),
            size: 0,
            obs_stats: RunningMeanStd::new(obs_dim),
            rng: StdRng::seed_from_u64(config.seed),
        }
    }

    fn check_dim(name: &str, expected: usize, actual: usize) -> Result<(), MixrlError> {
        if expected != actual {
            return Err(MixrlError::ShapeMismatch {
                name: name.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Appends a step to the open episode.
    pub fn push_step(
        &mut self,
        obs: &[f32],
        ctl: usize,
        state: &[f32],
        reward: f32,
        done: bool,
    ) -> Result<()> {
        Self::check_dim("obs", self.obs_dim, obs.len())?;
        Self::check_dim("state", self.state_dim, state.len())?;
        if ctl >= self.act_dim {
            return Err(MixrlError::InvalidAction {
                ctl,
                act_dim: self.act_dim,
            }
            .into());
        }

        self.current.obs.extend_from_slice(obs);
        self.current.state.extend_from_slice(state);
        self.current.ctl.push(ctl as u32);
        self.current.rwd.push(reward);
        self.current.done.push(if done { 1.0 } else { 0.0 });
        self.obs_stats.update(obs);
        Ok(())
    }

    /// Closes the open episode. Does nothing if no step has been pushed.
    pub fn close_episode(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let episode = std::mem::take(&mut self.current);
        self.size += episode.len();
        self.episodes.push_back(episode);

        while self.size > self.capacity && self.episodes.len() > 1 {
            if let Some(old) = self.episodes.pop_front() {
                trace!("Evict an episode of {} steps", old.len());
                self.size -= old.len();
            }
        }
    }

    /// The number of closed episodes.
    pub fn num_episodes(&self) -> usize {
        self.episodes.len()
    }

    /// The number of steps in closed episodes.
    pub fn num_steps(&self) -> usize {
        self.size
    }

    /// The number of transitions available to [`sample_random`](Self::sample_random).
    pub fn len(&self) -> usize {
        self.episodes
            .iter()
            .map(|e| e.len().saturating_sub(1))
            .sum()
    }

    /// Returns `true` if no transition can be sampled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The maximum number of stored steps.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Running mean of all pushed observations.
    pub fn obs_mean(&self) -> Array1<f32> {
        self.obs_stats.mean()
    }

    /// Running variance of all pushed observations.
    pub fn obs_variance(&self) -> Array1<f32> {
        self.obs_stats.variance()
    }

    /// Samples i.i.d. transitions uniformly over closed episodes.
    ///
    /// A transition pairs step `t` with step `t + 1` of the same episode;
    /// `done` is the flag stored with step `t + 1`.
    pub fn sample_random(&mut self, batch_size: usize) -> Result<TransitionBatch> {
        let cum: Vec<usize> = self
            .episodes
            .iter()
            .scan(0, |acc, e| {
                *acc += e.len().saturating_sub(1);
                Some(*acc)
            })
            .collect();
        let total = cum.last().copied().unwrap_or(0);
        if total == 0 {
            return Err(MixrlError::EmptyBuffer("transitions".to_string()).into());
        }

        let (od, sd) = (self.obs_dim, self.state_dim);
        let mut state = Vec::with_capacity(batch_size * sd);
        let mut obs = Vec::with_capacity(batch_size * od);
        let mut next_state = Vec::with_capacity(batch_size * sd);
        let mut next_obs = Vec::with_capacity(batch_size * od);
        let mut ctl = Vec::with_capacity(batch_size);
        let mut rwd = Vec::with_capacity(batch_size);
        let mut done = Vec::with_capacity(batch_size);

        for _ in 0..batch_size {
            let k = self.rng.gen_range(0..total);
            let ix = cum.partition_point(|&c| c <= k);
            let t = if ix == 0 { k } else { k - cum[ix - 1] };
            let e = &self.episodes[ix];

            state.extend_from_slice(&e.state[t * sd..(t + 1) * sd]);
            obs.extend_from_slice(&e.obs[t * od..(t + 1) * od]);
            next_state.extend_from_slice(&e.state[(t + 1) * sd..(t + 2) * sd]);
            next_obs.extend_from_slice(&e.obs[(t + 1) * od..(t + 2) * od]);
            ctl.push(e.ctl[t]);
            rwd.push(e.rwd[t]);
            done.push(e.done[t + 1]);
        }

        Ok(TransitionBatch {
            state: Array2::from_shape_vec((batch_size, sd), state)?,
            obs: Array2::from_shape_vec((batch_size, od), obs)?,
            ctl: Array1::from(ctl),
            rwd: Array1::from(rwd),
            next_state: Array2::from_shape_vec((batch_size, sd), next_state)?,
            next_obs: Array2::from_shape_vec((batch_size, od), next_obs)?,
            done: Array1::from(done),
        })
    }

    /// Samples windows of at most `seq_len` steps from closed episodes.
    ///
    /// Episodes are drawn uniformly, or proportionally to their lengths if
    /// `prioritize` is `true`. The start of each window is uniform over the
    /// episode. Windows shorter than the longest one are zero-padded.
    pub fn sample_episodes(
        &mut self,
        batch_size: usize,
        seq_len: usize,
        prioritize: bool,
    ) -> Result<EpisodeBatch> {
        if seq_len == 0 {
            return Err(MixrlError::InvalidConfig("seq_len must be positive".to_string()).into());
        }
        if self.episodes.is_empty() {
            return Err(MixrlError::EmptyBuffer("episodes".to_string()).into());
        }

        let ixs: Vec<usize> = if prioritize {
            let dist = WeightedIndex::new(self.episodes.iter().map(|e| e.len()))?;
            (0..batch_size).map(|_| dist.sample(&mut self.rng)).collect()
        } else {
            let n = self.episodes.len();
            (0..batch_size).map(|_| self.rng.gen_range(0..n)).collect()
        };

        // (episode index, window start, window length)
        let windows: Vec<(usize, usize, usize)> = ixs
            .into_iter()
            .map(|ix| {
                let ep_len = self.episodes[ix].len();
                let len = seq_len.min(ep_len);
                let start = self.rng.gen_range(0..=ep_len - len);
                (ix, start, len)
            })
            .collect();
        let t_max = windows.iter().map(|w| w.2).max().unwrap_or(0);

        let (od, sd) = (self.obs_dim, self.state_dim);
        let mut obs = Array3::<f32>::zeros((t_max, batch_size, od));
        let mut state = Array3::<f32>::zeros((t_max, batch_size, sd));
        let mut ctl = Array2::<u32>::zeros((t_max, batch_size));
        let mut rwd = Array2::<f32>::zeros((t_max, batch_size));
        let mut done = Array2::<f32>::zeros((t_max, batch_size));
        let mut mask = Array2::<f32>::zeros((t_max, batch_size));

        for (j, &(ix, start, len)) in windows.iter().enumerate() {
            let e = &self.episodes[ix];
            for t in 0..len {
                let s = start + t;
                for d in 0..od {
                    obs[[t, j, d]] = e.obs[s * od + d];
                }
                for d in 0..sd {
                    state[[t, j, d]] = e.state[s * sd + d];
                }
                ctl[[t, j]] = e.ctl[s];
                rwd[[t, j]] = e.rwd[s];
                done[[t, j]] = e.done[s];
                mask[[t, j]] = 1.0;
            }
        }

        Ok(EpisodeBatch {
            obs,
            ctl,
            state,
            rwd,
            done,
            mask,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with_episodes(lens: &[usize], capacity: usize) -> Result<EpisodeReplayBuffer> {
        let config = ReplayBufferConfig::default().capacity(capacity).seed(0);
        let mut buffer = EpisodeReplayBuffer::build(&config, 2, 3, 1);
        for (i, &len) in lens.iter().enumerate() {
            for t in 0..len {
                // Observations encode (episode, step) so samples can be traced back
                let obs = [i as f32 + 1.0, t as f32];
                buffer.push_step(&obs, t % 3, &[t as f32], t as f32, t == len - 1)?;
            }
            buffer.close_episode();
        }
        Ok(buffer)
    }

    #[test]
    fn test_push_rejects_bad_dims() -> Result<()> {
        let mut buffer = buffer_with_episodes(&[], 100)?;
        assert!(buffer.push_step(&[0.0], 0, &[0.0], 0.0, false).is_err());
        assert!(buffer.push_step(&[0.0, 0.0], 0, &[], 0.0, false).is_err());
        assert!(buffer.push_step(&[0.0, 0.0], 3, &[0.0], 0.0, false).is_err());
        Ok(())
    }

    #[test]
    fn test_sampling_empty_buffer_fails() -> Result<()> {
        let mut buffer = buffer_with_episodes(&[], 100)?;
        assert!(buffer.sample_random(4).is_err());
        assert!(buffer.sample_episodes(4, 3, false).is_err());

        // An open episode is not sampled
        buffer.push_step(&[1.0, 0.0], 0, &[0.0], 0.0, false)?;
        buffer.push_step(&[1.0, 1.0], 0, &[0.0], 0.0, false)?;
        assert!(buffer.sample_random(4).is_err());
        Ok(())
    }

    #[test]
    fn test_sample_random_pairs_consecutive_steps() -> Result<()> {
        let mut buffer = buffer_with_episodes(&[5, 3, 8], 100)?;
        assert_eq!(buffer.len(), 4 + 2 + 7);

        let batch = buffer.sample_random(64)?;
        assert_eq!(batch.len(), 64);
        assert_eq!(batch.obs.shape(), &[64, 2]);
        assert_eq!(batch.state.shape(), &[64, 1]);

        for i in 0..64 {
            // same episode, next step
            assert_eq!(batch.obs[[i, 0]], batch.next_obs[[i, 0]]);
            assert_eq!(batch.obs[[i, 1]] + 1.0, batch.next_obs[[i, 1]]);
            assert_eq!(batch.state[[i, 0]] + 1.0, batch.next_state[[i, 0]]);
            assert_eq!(batch.rwd[i], batch.obs[[i, 1]]);

            let ep_len = [5.0, 3.0, 8.0][batch.obs[[i, 0]] as usize - 1];
            let is_last = batch.next_obs[[i, 1]] == ep_len - 1.0;
            assert_eq!(batch.done[i], if is_last { 1.0 } else { 0.0 });
        }
        Ok(())
    }

    #[test]
    fn test_sample_episodes_pads_and_masks() -> Result<()> {
        let mut buffer = buffer_with_episodes(&[2, 6], 100)?;
        let batch = buffer.sample_episodes(16, 4, false)?;

        assert_eq!(batch.batch_size(), 16);
        assert!(batch.seq_len() <= 4);
        assert_eq!(batch.obs.shape(), &[batch.seq_len(), 16, 2]);

        for j in 0..16 {
            let valid: usize = (0..batch.seq_len())
                .filter(|&t| batch.mask[[t, j]] == 1.0)
                .count();
            let episode = batch.obs[[0, j, 0]];
            let expected = if episode == 1.0 { 2 } else { 4 };
            assert_eq!(valid, expected);

            for t in 0..batch.seq_len() {
                if batch.mask[[t, j]] == 0.0 {
                    assert_eq!(batch.obs[[t, j, 0]], 0.0);
                    assert_eq!(batch.obs[[t, j, 1]], 0.0);
                } else if t > 0 {
                    assert_eq!(batch.obs[[t, j, 1]], batch.obs[[t - 1, j, 1]] + 1.0);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_prioritized_sampling_prefers_long_episodes() -> Result<()> {
        let mut buffer = buffer_with_episodes(&[1, 99], 1000)?;
        let batch = buffer.sample_episodes(200, 1, true)?;
        let n_short = (0..200).filter(|&j| batch.obs[[0, j, 0]] == 1.0).count();
        assert!(n_short < 20);
        Ok(())
    }

    #[test]
    fn test_eviction_keeps_newest_episodes() -> Result<()> {
        let buffer = buffer_with_episodes(&[4, 4, 4], 9)?;
        assert_eq!(buffer.num_episodes(), 2);
        assert_eq!(buffer.num_steps(), 8);
        Ok(())
    }

    #[test]
    fn test_obs_statistics() -> Result<()> {
        let buffer = buffer_with_episodes(&[3], 100)?;
        let mean = buffer.obs_mean();
        let var = buffer.obs_variance();
        assert!((mean[0] - 1.0).abs() < 1e-6);
        assert!((mean[1] - 1.0).abs() < 1e-6);
        assert_eq!(var[0], 1e-6);
        assert!((var[1] - 2.0 / 3.0).abs() < 1e-6);
        Ok(())
    }
}
