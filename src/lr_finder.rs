use burn::{
    data::dataloader::{DataLoader, DataLoaderIterator},
    optim::{GradientsParams, Optimizer, SgdConfig},
    prelude::*,
    tensor::{ElementConversion, backend::AutodiffBackend},
};

use crate::{
    data::FashionMnistBatch,
    model::{Model, nll_loss},
};

#[derive(Config, Debug)]
pub struct LrFinderConfig {
    /// Lower end of the swept learning-rate range.
    #[config(default = 1e-5)]
    pub init_lr: f64,
    /// Upper end of the swept learning-rate range.
    #[config(default = 0.5)]
    pub max_lr: f64,
    /// Number of equal increments the range is partitioned into.
    #[config(default = 20)]
    pub steps: usize,
    /// Number of batches trained on at each swept rate.
    #[config(default = 10)]
    pub n_batch_per_step: usize,
}

/// Iterator over a dataloader's batches that restarts the underlying source
/// once it is exhausted, cycling indefinitely. An empty loader stays empty.
pub struct CyclingBatches<'a, B: Backend, O> {
    loader: &'a dyn DataLoader<B, O>,
    iter: Box<dyn DataLoaderIterator<O> + 'a>,
}

impl<'a, B: Backend, O> CyclingBatches<'a, B, O> {
    pub fn new(loader: &'a dyn DataLoader<B, O>) -> Self {
        Self {
            loader,
            iter: loader.iter(),
        }
    }
}

impl<B: Backend, O> Iterator for CyclingBatches<'_, B, O> {
    type Item = O;

    fn next(&mut self) -> Option<O> {
        if let Some(item) = self.iter.next() {
            return Some(item);
        }

        self.iter = self.loader.iter();
        self.iter.next()
    }
}

/// Bookkeeping for the sweep: the best (lowest) mean step loss seen and the
/// learning rate that produced it.
pub struct LrSweep {
    best_lr: f64,
    best_loss: f64,
}

impl LrSweep {
    pub fn new(init_lr: f64) -> Self {
        Self {
            best_lr: init_lr,
            best_loss: f64::INFINITY,
        }
    }

    /// Record the mean loss observed while training at `lr`.
    ///
    /// Returns `false` when the sweep has diverged and must stop: the loss is
    /// no longer finite or exceeds 4x the best loss seen so far.
    pub fn observe(&mut self, lr: f64, mean_loss: f64) -> bool {
        if !mean_loss.is_finite() || mean_loss > self.best_loss * 4.0 {
            return false;
        }

        if mean_loss < self.best_loss {
            self.best_loss = mean_loss;
            self.best_lr = lr;
        }

        true
    }

    /// The recommended rate: a safety margin below the best stable rate.
    pub fn recommendation(&self) -> f64 {
        self.best_lr / 4.0
    }
}

/// Sweep learning rates linearly across `[init_lr, max_lr]` and return a
/// recommended initial rate for training.
///
/// Each of the `steps` rates is trained for up to `n_batch_per_step` batches,
/// cycling through the loader, and scored by its sample-weighted mean loss.
/// The sweep stops early on divergence (see [LrSweep::observe]).
///
/// The sweep takes real gradient steps, which is why the model is consumed:
/// its parameters are garbage afterwards, and training must start from a
/// freshly initialized model.
///
/// # Panics
/// Panics if the loader yields no batches.
pub fn find<B: AutodiffBackend>(
    mut model: Model<B>,
    optimizer: &SgdConfig,
    loader: &dyn DataLoader<B, FashionMnistBatch<B>>,
    config: &LrFinderConfig,
) -> f64 {
    let mut optim = optimizer.init();
    let mut sweep = LrSweep::new(config.init_lr);
    let mut batches = CyclingBatches::new(loader);
    let increment = (config.max_lr - config.init_lr) / config.steps as f64;

    for step in 0..config.steps {
        let lr = config.init_lr + increment * step as f64;

        let mut loss_sum = 0.0f64;
        let mut num_samples = 0usize;

        for _ in 0..config.n_batch_per_step {
            let Some(batch) = batches.next() else { break };
            let batch_size = batch.targets.dims()[0];

            let output = model.forward(batch.images);
            let loss = nll_loss(output, batch.targets);
            let batch_loss = loss.clone().into_scalar().elem::<f64>();

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(lr, model, grads);

            loss_sum += batch_loss * batch_size as f64;
            num_samples += batch_size;
        }

        assert!(
            num_samples > 0,
            "cannot search for a learning rate over an empty dataset"
        );

        let mean_loss = loss_sum / num_samples as f64;
        log::info!("lr sweep step {step}: lr {lr:.5e}, mean loss {mean_loss:.6}");

        if !sweep.observe(lr, mean_loss) {
            log::info!("lr sweep diverged at step {step}, stopping early");
            break;
        }
    }

    sweep.recommendation()
}
