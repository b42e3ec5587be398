// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Top-k / top-p sampling with a repetition penalty.

use crate::{SamplingConfig, TokenId};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::VecDeque;

/// Picks the next token from a row of logits.
#[derive(Debug)]
pub struct Sampler {
    config: SamplingConfig,
    rng: StdRng,
    /// The most recent `repeat_last_n` tokens, oldest first.
    last_n: VecDeque<TokenId>,
}

impl Sampler {
    pub fn new(config: SamplingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            last_n: VecDeque::with_capacity(config.repeat_last_n),
            config,
            rng,
        }
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Records a token seen in the context (prompt or generated).
    pub fn accept(&mut self, id: TokenId) {
        if self.config.repeat_last_n == 0 {
            return;
        }
        if self.last_n.len() == self.config.repeat_last_n {
            self.last_n.pop_front();
        }
        self.last_n.push_back(id);
    }

    /// Forgets the token history.
    pub fn reset(&mut self) {
        self.last_n.clear();
    }

    /// Logits after the repetition penalty and temperature.
    fn adjusted(&self, logits: &[f32]) -> Vec<(f32, TokenId)> {
        let greedy = self.config.temperature <= 0.0;
        let scale = if greedy { 1.0 } else { 1.0 / self.config.temperature };
        let penalty = self.config.repeat_penalty;
        logits
            .iter()
            .enumerate()
            .map(|(i, &l)| {
                let id = i as TokenId;
                let l = if self.last_n.contains(&id) {
                    // Push toward zero probability either way.
                    if l < 0.0 {
                        l * penalty
                    } else {
                        l / penalty
                    }
                } else {
                    l
                };
                (l * scale, id)
            })
            .collect()
    }

    /// Samples a token. Ties are broken toward the lower id.
    pub fn sample(&mut self, logits: &[f32]) -> TokenId {
        let mut cands = self.adjusted(logits);
        cands.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        let Some(&(_, best)) = cands.first() else {
            return 0;
        };
        if self.config.temperature <= 0.0 {
            return best;
        }

        if self.config.top_k > 0 {
            cands.truncate(self.config.top_k);
        }

        let max = cands[0].0;
        let mut probs: Vec<f64> = cands.iter().map(|&(l, _)| f64::from(l - max).exp()).collect();
        let sum: f64 = probs.iter().sum();
        probs.iter_mut().for_each(|p| *p /= sum);

        if self.config.top_p < 1.0 {
            let mut cum = 0.0;
            let keep = probs
                .iter()
                .position(|&p| {
                    cum += p;
                    cum >= f64::from(self.config.top_p)
                })
                .map_or(probs.len(), |i| i + 1);
            probs.truncate(keep);
            cands.truncate(keep);
        }

        match WeightedIndex::new(&probs) {
            Ok(dist) => cands[dist.sample(&mut self.rng)].1,
            Err(_) => best,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(config: SamplingConfig) -> Sampler {
        Sampler::new(SamplingConfig {
            seed: Some(1234),
            ..config
        })
    }

    #[test]
    fn test_greedy_picks_argmax() {
        let mut s = seeded(SamplingConfig::greedy());
        assert_eq!(s.sample(&[0.1, 2.0, -1.0, 1.9]), 1);
    }

    #[test]
    fn test_greedy_tie_prefers_lower_id() {
        let mut s = seeded(SamplingConfig::greedy());
        assert_eq!(s.sample(&[1.0, 3.0, 3.0]), 1);
    }

    #[test]
    fn test_repetition_penalty_demotes_seen_tokens() {
        let mut s = seeded(SamplingConfig {
            repeat_penalty: 2.0,
            ..SamplingConfig::greedy()
        });
        let logits = [3.0, 2.0, -1.0];
        assert_eq!(s.sample(&logits), 0);
        s.accept(0);
        // 3.0 / 2 = 1.5 < 2.0
        assert_eq!(s.sample(&logits), 1);
    }

    #[test]
    fn test_penalty_makes_negative_logits_more_negative() {
        let mut s = seeded(SamplingConfig {
            repeat_penalty: 2.0,
            ..SamplingConfig::greedy()
        });
        s.accept(1);
        let adjusted = s.adjusted(&[-1.0, -0.6]);
        assert_eq!(adjusted[1].0, -1.2);
        assert_eq!(adjusted[0].0, -1.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut s = seeded(SamplingConfig {
            repeat_last_n: 2,
            ..SamplingConfig::default()
        });
        for id in 0..5 {
            s.accept(id);
        }
        assert_eq!(s.last_n, VecDeque::from(vec![3, 4]));
        s.reset();
        assert!(s.last_n.is_empty());
    }

    #[test]
    fn test_top_k_one_is_deterministic() {
        let mut s = seeded(SamplingConfig {
            top_k: 1,
            temperature: 1.0,
            ..SamplingConfig::default()
        });
        for _ in 0..20 {
            assert_eq!(s.sample(&[0.0, 0.5, 0.4]), 1);
        }
    }

    #[test]
    fn test_top_p_excludes_tail() {
        let mut s = seeded(SamplingConfig {
            top_k: 0,
            top_p: 0.5,
            temperature: 1.0,
            repeat_penalty: 1.0,
            ..SamplingConfig::default()
        });
        // Token 2 alone carries well over half the mass.
        for _ in 0..50 {
            assert_eq!(s.sample(&[0.0, 0.0, 6.0, 0.0]), 2);
        }
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let logits: Vec<f32> = (0..16).map(|i| (i as f32 * 0.37).sin()).collect();
        let config = SamplingConfig {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            ..SamplingConfig::default()
        };
        let mut a = seeded(config.clone());
        let mut b = seeded(config);
        let xs: Vec<_> = (0..32).map(|_| a.sample(&logits)).collect();
        let ys: Vec<_> = (0..32).map(|_| b.sample(&logits)).collect();
        assert_eq!(xs, ys);
    }
}
