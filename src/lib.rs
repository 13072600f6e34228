//! Fashion-MNIST image classification with a small CNN.
//!
//! The pipeline computes normalization statistics over the raw training set,
//! sweeps for a stable initial learning rate, then trains with an open-loop
//! cosine-annealed schedule while measuring test loss and accuracy per epoch.

pub mod data;
pub mod dataset;
pub mod lr_finder;
pub mod model;
pub mod training;
