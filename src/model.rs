use burn::{
    nn::{
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
    },
    prelude::*,
};

#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 10)]
    pub num_classes: usize,
    #[config(default = 128)]
    pub hidden_size: usize,
    #[config(default = 0.3)]
    pub dropout: f64,
}

/// A small CNN for 28x28 grayscale images: two convolution/pool/dropout
/// blocks followed by two fully-connected layers and a log-softmax output.
#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    pool: MaxPool2d,
    dropout: Dropout,
    fc1: Linear<B>,
    fc2: Linear<B>,
    activation: Relu,
}

impl ModelConfig {
    /// Initialize the model with fresh random parameters.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Model<B> {
        Model {
            conv1: Conv2dConfig::new([1, 8], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            conv2: Conv2dConfig::new([8, 16], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc1: LinearConfig::new(16 * 7 * 7, self.hidden_size).init(device),
            fc2: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

impl<B: Backend> Model<B> {
    /// Per-class log-probabilities for a batch of images.
    ///
    /// # Shapes
    ///   - Input [batch_size, height, width]
    ///   - Output [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch_size, height, width] = images.dims();
        let x = images.reshape([batch_size, 1, height, width]);

        let x = self.conv1.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool.forward(x);
        let x = self.dropout.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool.forward(x);
        let x = self.dropout.forward(x);

        let x = x.reshape([batch_size, 16 * 7 * 7]);
        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.fc2.forward(x);

        burn::tensor::activation::log_softmax(x, 1)
    }
}

/// Negative log-likelihood of integer targets under log-probability outputs,
/// averaged over the batch.
pub fn nll_loss<B: Backend>(log_probs: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
    let [batch_size, _num_classes] = log_probs.dims();
    let gathered = log_probs.gather(1, targets.reshape([batch_size, 1]));

    gathered.reshape([batch_size]).neg().mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::ElementConversion;

    type TestBackend = NdArray;

    #[test]
    fn forward_produces_one_score_per_class() {
        let device = Default::default();
        let model: Model<TestBackend> = ModelConfig::new().init(&device);

        let images = Tensor::<TestBackend, 3>::zeros([4, 28, 28], &device);
        let output = model.forward(images);

        assert_eq!(output.dims(), [4, 10]);
    }

    #[test]
    fn forward_outputs_normalized_log_probabilities() {
        let device = Default::default();
        let model: Model<TestBackend> = ModelConfig::new().init(&device);

        let images = Tensor::<TestBackend, 3>::ones([2, 28, 28], &device);
        let probs_per_sample = model.forward(images).exp().sum_dim(1);

        let sums = probs_per_sample.into_data().to_vec::<f32>().unwrap();
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
    }

    #[test]
    fn nll_loss_picks_target_class_log_probabilities() {
        let device = Default::default();
        let log_probs = Tensor::<TestBackend, 2>::from_floats(
            [[-0.5, -2.0, -3.0], [-4.0, -0.25, -6.0]],
            &device,
        );
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([0, 1], &device);

        let loss = nll_loss(log_probs, targets).into_scalar().elem::<f32>();

        // -((-0.5) + (-0.25)) / 2
        assert!((loss - 0.375).abs() < 1e-6);
    }
}
