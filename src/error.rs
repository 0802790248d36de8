// Renderer error types
//
// Every GPU call is checked and any non-success code becomes a fatal
// RenderError. Nothing in the core retries; the binary logs the error and
// exits non-zero.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    /// The Vulkan loader library could not be opened
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// A Vulkan call returned a non-success code
    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    #[error("No Vulkan physical device found")]
    DeviceNotFound,

    #[error("No queue family supports both graphics and transfer")]
    NoSuitableQueueFamily,

    #[error("Required extension not supported: {0}")]
    ExtensionUnsupported(String),

    #[error("Surface unsupported: {0}")]
    SurfaceUnsupported(String),

    #[error("Surface reports no usable format")]
    NoValidFormat,

    #[error("No memory type matches mask {type_mask:#b} with flags {flags:?}")]
    NoCompatibleMemoryType {
        type_mask: u32,
        flags: vk::MemoryPropertyFlags,
    },

    #[error("Failed to load shader {path:?}: {source}")]
    ShaderLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to open mesh {path:?}: {source}")]
    MeshOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to load mesh {path:?}: {source}")]
    MeshLoad {
        path: PathBuf,
        source: tobj::LoadError,
    },

    #[error("Window error: {0}")]
    Window(String),

    /// A bounded wait expired
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// Acquire or present reported the chain no longer matches the surface
    #[error("Swapchain is out of date")]
    SwapchainOutOfDate,

    #[error("Presentation engine returned image index {index} but only {count} slots exist")]
    InvalidImageIndex { index: u32, count: usize },

    #[error("Per-slot resource count mismatch: {resource} has {found}, expected {expected}")]
    SlotCountMismatch {
        resource: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Descriptor write targets set {set} but only {count} sets were allocated")]
    DescriptorSetOutOfRange { set: usize, count: usize },

    #[error("Buffer memory is not host visible")]
    NotHostVisible,

    #[error("Write of {len} bytes exceeds buffer of {capacity} bytes")]
    BufferOverflow { len: usize, capacity: usize },

    /// The validation layer reported an error-severity message
    #[error("Validation error: {0}")]
    Validation(String),
}

pub type RenderResult<T> = std::result::Result<T, RenderError>;

/// Attach the failing call's name to a raw `VkResult`
pub trait VkResultExt<T> {
    fn call(self, name: &'static str) -> RenderResult<T>;
}

impl<T> VkResultExt<T> for ash::prelude::VkResult<T> {
    fn call(self, name: &'static str) -> RenderResult<T> {
        self.map_err(|result| RenderError::Vulkan { call: name, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_error_names_the_call() {
        let res: ash::prelude::VkResult<()> = Err(vk::Result::ERROR_DEVICE_LOST);
        let err = res.call("vkQueueSubmit").unwrap_err();
        assert!(matches!(
            err,
            RenderError::Vulkan { call: "vkQueueSubmit", result: vk::Result::ERROR_DEVICE_LOST }
        ));
        assert!(err.to_string().starts_with("vkQueueSubmit failed"));
    }

    #[test]
    fn memory_type_error_is_attributable() {
        let err = RenderError::NoCompatibleMemoryType {
            type_mask: 0b101,
            flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
        };
        let text = err.to_string();
        assert!(text.contains("0b101"));
        assert!(text.contains("HOST_VISIBLE"));
    }
}
