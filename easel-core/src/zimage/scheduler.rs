use serde::Deserialize;

/// Flow-match Euler scheduler used by the turbo-distilled transformer.
///
/// The model predicts velocity; a step is a plain Euler update along the
/// sigma schedule. Turbo checkpoints want a shifted schedule so that the
/// few inference steps concentrate where the trajectory bends.
#[derive(Debug, Clone)]
pub struct FlowMatchScheduler {
    pub num_train_timesteps: usize,
    pub shift: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub num_train_timesteps: usize,
    pub shift: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            shift: 3.0,
        }
    }
}

impl FlowMatchScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            num_train_timesteps: config.num_train_timesteps.max(1),
            shift: config.shift,
        }
    }

    /// Sigma schedule for `steps` inference steps: `steps + 1` values,
    /// strictly non-increasing from 1.0 down to exactly 0.0.
    pub fn sigmas(&self, steps: usize) -> Vec<f64> {
        let steps = steps.max(1);
        let mut sigmas = Vec::with_capacity(steps + 1);
        for i in 0..steps {
            let linear = 1.0 - i as f64 / steps as f64;
            sigmas.push(self.time_shift(linear));
        }
        sigmas.push(0.0);
        sigmas
    }

    /// Training-domain timestep for a given sigma, fed to the transformer's
    /// timestep embedder.
    pub fn timestep(&self, sigma: f64) -> f64 {
        sigma * self.num_train_timesteps as f64
    }

    // sigma' = shift * sigma / (1 + (shift - 1) * sigma)
    fn time_shift(&self, sigma: f64) -> f64 {
        if self.shift == 1.0 {
            return sigma;
        }
        self.shift * sigma / (1.0 + (self.shift - 1.0) * sigma)
    }

    /// Euler update: `x += (sigma_next - sigma) * velocity`, elementwise.
    pub fn step(
        &self,
        latents: &candle_core::Tensor,
        velocity: &candle_core::Tensor,
        sigma: f64,
        sigma_next: f64,
    ) -> candle_core::Result<candle_core::Tensor> {
        latents + (velocity * (sigma_next - sigma))?
    }
}
