//! Backend support.
//!
//! The orchestration math runs on any Burn backend; pick one via feature
//! flags:
//!
//! - `ndarray`: CPU backend (no GPU required)
//! - `wgpu`: WebGPU backend (cross-platform GPU support)
//!
//! ```toml
//! [dependencies]
//! latentkit = { version = "0.1", features = ["ndarray"] }
//! ```

#[cfg(feature = "ndarray")]
pub use burn_ndarray::{NdArray, NdArrayDevice};

#[cfg(feature = "wgpu")]
pub use burn_wgpu::{Wgpu, WgpuDevice};

/// Type alias for the default backend when using the ndarray feature
#[cfg(feature = "ndarray")]
pub type DefaultBackend = NdArray;

/// Type alias for the default backend when using the wgpu feature
#[cfg(all(feature = "wgpu", not(feature = "ndarray")))]
pub type DefaultBackend = Wgpu;

/// Get the default device for the enabled backend
#[cfg(feature = "ndarray")]
pub fn default_device() -> NdArrayDevice {
    NdArrayDevice::default()
}

/// Get the default device for the enabled backend
#[cfg(all(feature = "wgpu", not(feature = "ndarray")))]
pub fn default_device() -> WgpuDevice {
    WgpuDevice::default()
}
