use burn::backend::Autodiff;

use fashion_mnist::training;

#[allow(unreachable_code)]
fn main() {
    env_logger::init();

    #[cfg(feature = "ndarray")]
    {
        use burn::backend::{NdArray, ndarray::NdArrayDevice};
        return training::run::<Autodiff<NdArray>>(NdArrayDevice::Cpu);
    }

    #[cfg(feature = "tch-cpu")]
    {
        use burn::backend::{LibTorch, libtorch::LibTorchDevice};
        return training::run::<Autodiff<LibTorch>>(LibTorchDevice::Cpu);
    }

    #[cfg(all(feature = "tch-gpu", not(target_os = "macos")))]
    {
        use burn::backend::{LibTorch, libtorch::LibTorchDevice};
        return training::run::<Autodiff<LibTorch>>(LibTorchDevice::Cuda(0));
    }

    #[cfg(all(feature = "tch-gpu", target_os = "macos"))]
    {
        use burn::backend::{LibTorch, libtorch::LibTorchDevice};
        return training::run::<Autodiff<LibTorch>>(LibTorchDevice::Mps);
    }

    #[cfg(feature = "wgpu")]
    {
        use burn::backend::{Wgpu, wgpu::WgpuDevice};
        return training::run::<Autodiff<Wgpu>>(WgpuDevice::default());
    }

    unreachable!("At least one backend feature must be enabled.")
}
