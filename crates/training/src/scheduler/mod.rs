use crate::TrainingError;

/// Learning-rate schedule advanced once per training epoch.
pub trait LRScheduler: Send {
    /// Advances one epoch and returns the learning rate to use next.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn steps_taken(&self) -> usize;
}

/// Multiplies the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone, PartialEq)]
pub struct StepLr {
    base_lr: f64,
    step_size: usize,
    gamma: f64,
    steps_taken: usize,
    current_lr: f64,
}

impl StepLr {
    pub fn new(base_lr: f64, step_size: usize, gamma: f64) -> Result<Self, TrainingError> {
        if step_size == 0 {
            return Err(TrainingError::initialization(
                "step scheduler requires step_size greater than zero",
            ));
        }
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "step scheduler requires a positive base learning rate",
            ));
        }
        Ok(Self {
            base_lr,
            step_size,
            gamma,
            steps_taken: 0,
            current_lr: base_lr,
        })
    }

    pub fn step_size(&self) -> usize {
        self.step_size
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    fn lr_at(&self, steps: usize) -> f64 {
        let decays = (steps / self.step_size) as i32;
        self.base_lr * self.gamma.powi(decays)
    }
}

impl LRScheduler for StepLr {
    fn step(&mut self) -> f64 {
        self.steps_taken += 1;
        self.current_lr = self.lr_at(self.steps_taken);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn steps_taken(&self) -> usize {
        self.steps_taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decays_every_step_size_epochs() {
        let mut scheduler = StepLr::new(0.1, 2, 0.5).unwrap();
        let lrs: Vec<f64> = (0..5).map(|_| scheduler.step()).collect();

        let expected = [0.1, 0.05, 0.05, 0.025, 0.025];
        for (lr, want) in lrs.iter().zip(expected) {
            assert!((lr - want).abs() < 1e-12, "{lrs:?}");
        }
        assert_eq!(scheduler.steps_taken(), 5);
    }

    #[test]
    fn step_size_past_the_run_never_decays() {
        let epochs = 4;
        let mut scheduler = StepLr::new(1e-3, epochs + 1, 0.1).unwrap();
        for _ in 0..epochs {
            scheduler.step();
        }
        assert_eq!(scheduler.learning_rate(), 1e-3);
    }

    #[test]
    fn zero_step_size_is_rejected() {
        assert!(StepLr::new(1e-3, 0, 0.1).is_err());
    }
}
