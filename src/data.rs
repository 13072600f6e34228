use burn::{
    data::dataloader::{DataLoader, batcher::Batcher},
    tensor::{ElementConversion, Int, Tensor, TensorData, backend::Backend},
};

use crate::dataset::FashionMnistItem;

/// Per-pixel normalization statistics of the training set.
///
/// `mean` and `std` are the averages of the per-sample pixel mean and the
/// per-sample pixel standard deviation over every training image. The std is
/// a weighted sum of per-sample standard deviations, not a pooled standard
/// deviation over the whole dataset.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PixelStats {
    pub mean: f64,
    pub std: f64,
}

/// Batches [FashionMnistItem]s into image/target tensors.
///
/// Pixels are scaled to [0, 1]. A batcher built with [normalized](Self::normalized)
/// additionally centers and scales them with the provided statistics; the
/// [raw](Self::raw) batcher is what those statistics are computed from.
#[derive(Clone, Debug, Default)]
pub struct FashionMnistBatcher {
    stats: Option<PixelStats>,
}

#[derive(Clone, Debug)]
pub struct FashionMnistBatch<B: Backend> {
    pub images: Tensor<B, 3>,
    pub targets: Tensor<B, 1, Int>,
}

impl FashionMnistBatcher {
    /// A batcher that only scales pixels to [0, 1].
    pub fn raw() -> Self {
        Self { stats: None }
    }

    /// A batcher that normalizes pixels with the given training-set statistics.
    pub fn normalized(stats: PixelStats) -> Self {
        Self { stats: Some(stats) }
    }
}

impl<B: Backend> Batcher<B, FashionMnistItem, FashionMnistBatch<B>> for FashionMnistBatcher {
    fn batch(&self, items: Vec<FashionMnistItem>, device: &B::Device) -> FashionMnistBatch<B> {
        let images = items
            .iter()
            .map(|item| TensorData::from(item.image))
            .map(|data| Tensor::<B, 2>::from_data(data.convert::<B::FloatElem>(), device))
            .map(|tensor| tensor.reshape([1, 28, 28]))
            .map(|tensor| {
                let tensor = tensor / 255;
                match self.stats {
                    Some(stats) => (tensor - stats.mean) / stats.std,
                    None => tensor,
                }
            })
            .collect();

        let targets = items
            .iter()
            .map(|item| {
                Tensor::<B, 1, Int>::from_data(
                    [(item.label as i64).elem::<B::IntElem>()],
                    device,
                )
            })
            .collect();

        FashionMnistBatch {
            images: Tensor::cat(images, 0),
            targets: Tensor::cat(targets, 0),
        }
    }
}

/// Compute normalization statistics in one streaming pass over raw batches.
///
/// The batches must come from a [raw](FashionMnistBatcher::raw) batcher:
/// statistics are only meaningful when computed from unnormalized data.
///
/// # Panics
/// Panics if the loader yields no samples.
pub fn pixel_stats<B: Backend>(loader: &dyn DataLoader<B, FashionMnistBatch<B>>) -> PixelStats {
    let mut mean_sum = 0.0f64;
    let mut std_sum = 0.0f64;
    let mut num_samples = 0usize;

    for batch in loader.iter() {
        let [batch_size, height, width] = batch.images.dims();
        let flattened = batch.images.reshape([batch_size, height * width]);

        // Per-sample mean and (unbiased) standard deviation across pixels.
        let mean = flattened.clone().mean_dim(1);
        let std = flattened.var(1).sqrt();

        mean_sum += mean.sum().into_scalar().elem::<f64>();
        std_sum += std.sum().into_scalar().elem::<f64>();
        num_samples += batch_size;
    }

    assert!(
        num_samples > 0,
        "cannot compute statistics over an empty dataset"
    );

    PixelStats {
        mean: mean_sum / num_samples as f64,
        std: std_sum / num_samples as f64,
    }
}
