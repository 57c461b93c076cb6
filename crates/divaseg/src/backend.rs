//! Compute backend chosen at build time by the `cuda`, `wgpu` or `ndarray`
//! feature. CUDA wins over WGPU, and NdArray is the fallback.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "cuda")] {
        /// Backend the CLI builds batches on.
        pub type SelectedBackend = burn::backend::cuda::Cuda;
        pub type SelectedDevice = burn::backend::cuda::CudaDevice;
        pub const BACKEND_NAME: &str = "CUDA (NVIDIA GPU)";
    } else if #[cfg(feature = "wgpu")] {
        /// Backend the CLI builds batches on.
        pub type SelectedBackend = burn::backend::wgpu::Wgpu;
        pub type SelectedDevice = burn::backend::wgpu::WgpuDevice;
        pub const BACKEND_NAME: &str = "WGPU (GPU)";
    } else {
        /// Backend the CLI builds batches on.
        pub type SelectedBackend = burn::backend::ndarray::NdArray;
        pub type SelectedDevice = burn::backend::ndarray::NdArrayDevice;
        pub const BACKEND_NAME: &str = "NdArray (CPU)";
    }
}

/// Default device of [`SelectedBackend`].
pub fn create_device() -> SelectedDevice {
    SelectedDevice::default()
}
