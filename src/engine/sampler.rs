//! Next-token selection from logits.
//!
//! ```text
//! logits [vocab]
//!     │  temperature == 0 ──────────────► argmax
//!     ▼
//! logits / temperature ─► top-k ─► softmax ─► top-p ─► weighted draw
//! ```
//!
//! Each generation stream gets its own [`Sampler`], so a seeded stream draws
//! the same tokens regardless of what else shares its batch.

use candle_core::{DType, Tensor, D};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::GenerateConfig;
use crate::error::{Error, Result};

/// Per-stream token sampler.
#[derive(Debug, Clone)]
pub struct Sampler {
    temperature: f32,
    /// 0 = disabled.
    top_k: usize,
    /// 1.0 = disabled.
    top_p: f32,
    rng: StdRng,
}

impl Sampler {
    /// Build a sampler from a stream's generation settings.
    ///
    /// Uses `config.seed` when set, entropy otherwise.
    pub fn from_config(config: &GenerateConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            rng,
        }
    }

    /// Greedy sampler.
    pub fn greedy() -> Self {
        Self::from_config(&GenerateConfig {
            seed: Some(0),
            ..GenerateConfig::greedy(0)
        })
    }

    /// Whether this sampler always picks the highest logit.
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// Pick one token from a `[vocab]` (or `[1, vocab]`) logits tensor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compute`] for empty or non-finite logits and
    /// [`Error::Tensor`] if the tensor cannot be read.
    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        let logits = logits.flatten_all()?.to_dtype(DType::F32)?;
        let vocab_size = logits.dim(0)?;
        if vocab_size == 0 {
            return Err(Error::Compute("empty logits row".to_string()));
        }

        if self.is_greedy() {
            return Ok(logits.argmax(D::Minus1)?.to_scalar::<u32>()?);
        }

        let scaled = if self.temperature != 1.0 {
            (logits / self.temperature as f64)?
        } else {
            logits
        };

        // Candidates sorted by logit, best first, cut to top-k.
        let values: Vec<f32> = scaled.to_vec1()?;
        let mut order: Vec<u32> = (0..vocab_size as u32).collect();
        order.sort_by(|&a, &b| {
            values[b as usize]
                .partial_cmp(&values[a as usize])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if self.top_k > 0 && self.top_k < vocab_size {
            order.truncate(self.top_k);
        }

        let kept: Vec<f32> = order.iter().map(|&i| values[i as usize]).collect();
        let kept_len = kept.len();
        let probs = candle_nn::ops::softmax(&Tensor::from_vec(kept, kept_len, scaled.device())?, D::Minus1)?;
        let mut probs: Vec<f32> = probs.to_vec1()?;

        if self.top_p > 0.0 && self.top_p < 1.0 {
            let mut cumulative = 0.0f32;
            let cutoff = probs
                .iter()
                .position(|&p| {
                    cumulative += p;
                    cumulative > self.top_p
                })
                .map_or(probs.len(), |idx| idx + 1);
            probs.truncate(cutoff);
            order.truncate(cutoff);
        }

        let dist = WeightedIndex::new(&probs)
            .map_err(|e| Error::Compute(format!("invalid token distribution: {e}")))?;
        Ok(order[dist.sample(&mut self.rng)])
    }
}
