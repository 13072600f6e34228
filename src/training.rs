use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    lr_scheduler::{LrScheduler, cosine::CosineAnnealingLrSchedulerConfig},
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer, SgdConfig},
    prelude::*,
    tensor::{ElementConversion, backend::AutodiffBackend},
};

use crate::{
    data::{FashionMnistBatch, FashionMnistBatcher, pixel_stats},
    dataset::FashionMnistDataset,
    lr_finder::{self, LrFinderConfig},
    model::{Model, ModelConfig, nll_loss},
};

#[derive(Config)]
pub struct TrainingConfig {
    #[config(default = 6)]
    pub num_epochs: usize,
    #[config(default = 64)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    /// Period of the cosine learning-rate schedule, in epochs.
    #[config(default = 10)]
    pub t_max: usize,
    /// Progress is logged every `log_interval` batches.
    #[config(default = 50)]
    pub log_interval: usize,
    pub optimizer: SgdConfig,
    pub model: ModelConfig,
    pub lr_finder: LrFinderConfig,
}

/// One appended entry of the per-epoch training log.
#[derive(Clone, Debug)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub test_loss: f64,
    pub test_accuracy: f64,
    pub lr: f64,
}

/// Train for one epoch at a fixed learning rate.
///
/// Returns the updated model and the sample-weighted mean training loss.
///
/// # Panics
/// Panics if the loader yields no samples.
pub fn train_epoch<B: AutodiffBackend, O: Optimizer<Model<B>, B>>(
    mut model: Model<B>,
    optim: &mut O,
    lr: f64,
    loader: &dyn DataLoader<B, FashionMnistBatch<B>>,
    log_interval: usize,
) -> (Model<B>, f64) {
    let num_items = loader.num_items();
    let mut loss_sum = 0.0f64;
    let mut num_samples = 0usize;

    for (iteration, batch) in loader.iter().enumerate() {
        let batch_size = batch.targets.dims()[0];

        let output = model.forward(batch.images);
        let loss = nll_loss(output, batch.targets);
        let batch_loss = loss.clone().into_scalar().elem::<f64>();

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optim.step(lr, model, grads);

        loss_sum += batch_loss * batch_size as f64;
        num_samples += batch_size;

        if log_interval != 0 && iteration % log_interval == 0 {
            log::info!(
                "batch {iteration} [{num_samples}/{num_items} ({:.0}%)] loss {batch_loss:.6}",
                100.0 * num_samples as f64 / num_items as f64,
            );
        }
    }

    assert!(num_samples > 0, "cannot train on an empty dataset");

    (model, loss_sum / num_samples as f64)
}

/// Evaluation totals, accumulated batch by batch.
#[derive(Debug, Default)]
pub struct Tally {
    loss_sum: f64,
    num_correct: usize,
    num_samples: usize,
}

impl Tally {
    pub fn update(&mut self, loss_sum: f64, num_correct: usize, num_samples: usize) {
        self.loss_sum += loss_sum;
        self.num_correct += num_correct;
        self.num_samples += num_samples;
    }

    /// Mean per-sample loss and accuracy fraction.
    ///
    /// # Panics
    /// Panics if no samples were tallied.
    pub fn finish(&self) -> (f64, f64) {
        assert!(
            self.num_samples > 0,
            "cannot evaluate on an empty dataset"
        );

        (
            self.loss_sum / self.num_samples as f64,
            self.num_correct as f64 / self.num_samples as f64,
        )
    }
}

/// Count the predictions (arg-max class index) that match the targets.
pub fn count_correct<B: Backend>(log_probs: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size, _num_classes] = log_probs.dims();
    let predicted = log_probs.argmax(1).reshape([batch_size]);

    predicted
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}

/// Measure mean loss and accuracy over the test set.
///
/// Runs without gradient computation or parameter updates; call it on the
/// autodiff-free model ([AutodiffModule::valid]) during training.
pub fn evaluate<B: Backend>(
    model: &Model<B>,
    loader: &dyn DataLoader<B, FashionMnistBatch<B>>,
) -> (f64, f64) {
    let mut tally = Tally::default();

    for batch in loader.iter() {
        let batch_size = batch.targets.dims()[0];

        let output = model.forward(batch.images);
        let loss = nll_loss(output.clone(), batch.targets.clone());

        tally.update(
            loss.into_scalar().elem::<f64>() * batch_size as f64,
            count_correct(output, batch.targets),
            batch_size,
        );
    }

    tally.finish()
}

/// Run the epoch loop: each epoch trains at the next rate of the
/// cosine-annealed schedule, evaluates, and appends a log record. The
/// schedule is open-loop: it ignores the measured losses entirely.
#[allow(clippy::too_many_arguments)]
pub fn fit<B: AutodiffBackend, O: Optimizer<Model<B>, B>>(
    mut model: Model<B>,
    optim: &mut O,
    initial_lr: f64,
    t_max: usize,
    num_epochs: usize,
    loader_train: &dyn DataLoader<B, FashionMnistBatch<B>>,
    loader_test: &dyn DataLoader<B::InnerBackend, FashionMnistBatch<B::InnerBackend>>,
    log_interval: usize,
) -> (Model<B>, Vec<EpochRecord>) {
    let mut records = Vec::with_capacity(num_epochs);
    if num_epochs == 0 {
        return (model, records);
    }

    let mut scheduler = CosineAnnealingLrSchedulerConfig::new(initial_lr, t_max)
        .init()
        .expect("cosine scheduler configuration should be valid");

    for epoch in 1..num_epochs + 1 {
        // The scheduler yields `initial_lr` on its first step, so stepping at
        // the top of the loop gives each epoch its own cosine position.
        let lr = scheduler.step();
        log::info!("epoch {epoch}/{num_epochs}, lr {lr:.5e}");

        let (trained, train_loss) = train_epoch(model, optim, lr, loader_train, log_interval);
        model = trained;

        let (test_loss, test_accuracy) = evaluate(&model.valid(), loader_test);

        records.push(EpochRecord {
            epoch,
            train_loss,
            test_loss,
            test_accuracy,
            lr,
        });
    }

    (model, records)
}

/// End-to-end driver: load the data, compute normalization statistics from
/// the raw training set, search for an initial learning rate, then train and
/// evaluate for the configured number of epochs.
pub fn run<B: AutodiffBackend>(device: B::Device) {
    let config = TrainingConfig::new(SgdConfig::new(), ModelConfig::new(), LrFinderConfig::new());
    B::seed(config.seed);

    // Statistics must come from unnormalized data, so the training set is
    // loaded twice: once raw for the statistics pass, once normalized.
    log::info!("computing dataset statistics");
    let loader_raw: std::sync::Arc<
        dyn DataLoader<B::InnerBackend, FashionMnistBatch<B::InnerBackend>>,
    > = DataLoaderBuilder::new(FashionMnistBatcher::raw())
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(FashionMnistDataset::train());
    let stats = pixel_stats(loader_raw.as_ref());
    log::info!("train set statistics: mean {:.6}, std {:.6}", stats.mean, stats.std);

    let batcher = FashionMnistBatcher::normalized(stats);
    let loader_train: std::sync::Arc<dyn DataLoader<B, FashionMnistBatch<B>>> =
        DataLoaderBuilder::new(batcher.clone())
            .batch_size(config.batch_size)
            .shuffle(config.seed)
            .num_workers(config.num_workers)
            .build(FashionMnistDataset::train());
    let loader_test: std::sync::Arc<
        dyn DataLoader<B::InnerBackend, FashionMnistBatch<B::InnerBackend>>,
    > = DataLoaderBuilder::new(batcher)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(FashionMnistDataset::test());

    log::info!("searching for an initial learning rate");
    let search_model = config.model.init::<B>(&device);
    let initial_lr = lr_finder::find(
        search_model,
        &config.optimizer,
        loader_train.as_ref(),
        &config.lr_finder,
    );
    log::info!("recommended learning rate: {initial_lr:.5e}");

    // The search took real gradient steps; training starts over from a fresh
    // random initialization, not from the searched parameters.
    let model = config.model.init::<B>(&device);
    let mut optim = config.optimizer.init();

    let (_model, records) = fit(
        model,
        &mut optim,
        initial_lr,
        config.t_max,
        config.num_epochs,
        loader_train.as_ref(),
        loader_test.as_ref(),
        config.log_interval,
    );

    println!("epoch | train loss | test loss | test acc | lr");
    for record in &records {
        println!(
            "{:>5} | {:>10.6} | {:>9.6} | {:>7.2}% | {:.5e}",
            record.epoch,
            record.train_loss,
            record.test_loss,
            100.0 * record.test_accuracy,
            record.lr,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::FashionMnistItem;
    use burn::backend::{Autodiff, NdArray};
    use burn::data::{dataloader::DataLoaderBuilder, dataset::InMemDataset};
    use std::sync::Arc;

    type TestBackend = NdArray;
    type TestAutodiffBackend = Autodiff<NdArray>;

    fn items(count: usize) -> Vec<FashionMnistItem> {
        (0..count)
            .map(|i| FashionMnistItem {
                image: [[(i * 20) as f32; 28]; 28],
                label: (i % 10) as u8,
            })
            .collect()
    }

    fn loader<B: Backend>(
        count: usize,
        batch_size: usize,
    ) -> Arc<dyn DataLoader<B, FashionMnistBatch<B>>> {
        DataLoaderBuilder::new(FashionMnistBatcher::raw())
            .batch_size(batch_size)
            .build(InMemDataset::new(items(count)))
    }

    #[test]
    fn always_predicting_class_zero_scores_the_class_zero_fraction() {
        let device = Default::default();

        // Scores peaked on index 0 for every sample, i.e. a model stuck on class 0.
        let mut scores = vec![0.0f32; 100 * 10];
        for row in 0..100 {
            scores[row * 10] = 1.0;
        }
        let output =
            Tensor::<TestBackend, 2>::from_data(TensorData::new(scores, [100, 10]), &device);
        let labels: Vec<i64> = (0..100).map(|i| i % 10).collect();
        let targets =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::new(labels, [100]), &device);

        let mut tally = Tally::default();
        tally.update(0.0, count_correct(output, targets), 100);

        let (_, accuracy) = tally.finish();
        assert_eq!(accuracy, 0.1);
    }

    #[test]
    fn tally_reports_mean_loss_over_all_samples() {
        let mut tally = Tally::default();
        tally.update(6.0, 2, 4);
        tally.update(2.0, 1, 4);

        let (loss, accuracy) = tally.finish();
        assert_eq!(loss, 1.0);
        assert_eq!(accuracy, 0.375);
    }

    #[test]
    #[should_panic(expected = "empty dataset")]
    fn tally_fails_without_samples() {
        Tally::default().finish();
    }

    #[test]
    fn evaluation_is_deterministic() {
        let device = Default::default();
        let model: Model<TestBackend> = ModelConfig::new().init(&device);
        let loader = loader::<TestBackend>(8, 4);

        let first = evaluate(&model, loader.as_ref());
        let second = evaluate(&model, loader.as_ref());

        assert_eq!(first, second);
    }

    #[test]
    fn zero_epochs_performs_no_training() {
        let device = Default::default();
        let model: Model<TestAutodiffBackend> = ModelConfig::new().init(&device);
        let mut optim = SgdConfig::new().init();

        let probe = Tensor::<TestBackend, 3>::ones([1, 28, 28], &device);
        let before = model.valid().forward(probe.clone()).into_data();

        let loader_train = loader::<TestAutodiffBackend>(8, 4);
        let loader_test = loader::<TestBackend>(8, 4);

        let (model, records) = fit(
            model,
            &mut optim,
            0.1,
            10,
            0,
            loader_train.as_ref(),
            loader_test.as_ref(),
            0,
        );

        assert!(records.is_empty());
        let after = model.valid().forward(probe).into_data();
        assert_eq!(before, after);
    }

    #[test]
    fn recorded_rates_follow_the_cosine_schedule() {
        let device = Default::default();
        let model: Model<TestAutodiffBackend> = ModelConfig::new().init(&device);
        let mut optim = SgdConfig::new().init();

        let loader_train = loader::<TestAutodiffBackend>(8, 4);
        let loader_test = loader::<TestBackend>(8, 4);

        let initial_lr = 0.1;
        let t_max = 10;
        let (_, records) = fit(
            model,
            &mut optim,
            initial_lr,
            t_max,
            3,
            loader_train.as_ref(),
            loader_test.as_ref(),
            0,
        );

        // Epoch n trains at the n-th cosine position, starting at the
        // initial rate; each epoch in the first half-period gets a new,
        // strictly lower rate.
        let lrs: Vec<f64> = records.iter().map(|r| r.lr).collect();
        for (epoch_index, lr) in lrs.iter().enumerate() {
            let expected = initial_lr
                * 0.5
                * (1.0 + (std::f64::consts::PI * epoch_index as f64 / t_max as f64).cos());
            assert!(
                (lr - expected).abs() < 1e-9,
                "epoch {} lr {lr} != expected {expected}",
                epoch_index + 1,
            );
        }
        assert_eq!(lrs[0], initial_lr);
        assert!(lrs[0] > lrs[1] && lrs[1] > lrs[2]);
    }

    #[test]
    fn one_epoch_trains_and_logs_a_record() {
        let device = Default::default();
        let model: Model<TestAutodiffBackend> = ModelConfig::new().init(&device);
        let mut optim = SgdConfig::new().init();

        let loader_train = loader::<TestAutodiffBackend>(8, 4);
        let loader_test = loader::<TestBackend>(8, 4);

        let (_, records) = fit(
            model,
            &mut optim,
            0.05,
            10,
            1,
            loader_train.as_ref(),
            loader_test.as_ref(),
            0,
        );

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.epoch, 1);
        assert_eq!(record.lr, 0.05);
        assert!(record.train_loss.is_finite());
        assert!(record.test_loss.is_finite());
        assert!((0.0..=1.0).contains(&record.test_accuracy));
    }
}
