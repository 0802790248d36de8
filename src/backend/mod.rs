// Backend module - Vulkan abstraction layer
//
// Thin RAII wrappers around ash. Every wrapper holds an Arc<GpuContext> so
// the device always outlives the objects created from it.

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod pipeline;
pub mod query;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use device::GpuContext;
pub use swapchain::Swapchain;
