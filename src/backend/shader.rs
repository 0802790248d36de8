// Shader module loading
//
// Shaders are SPIR-V files read fully into memory. Nothing beyond a
// successful read and word alignment is checked here; the driver validates
// the module.

use ash::vk;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use super::GpuContext;
use crate::error::{RenderError, RenderResult, VkResultExt};

pub struct ShaderModule {
    pub handle: vk::ShaderModule,
    context: Arc<GpuContext>,
}

impl ShaderModule {
    pub fn load(context: &Arc<GpuContext>, path: &Path) -> RenderResult<Self> {
        let code = read_spirv(path)?;
        log::debug!("Loaded shader {:?} ({} words)", path, code.len());
        Self::from_words(context, &code)
    }

    pub fn from_words(context: &Arc<GpuContext>, code: &[u32]) -> RenderResult<Self> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

        let handle = unsafe { context.device.create_shader_module(&create_info, None) }
            .call("vkCreateShaderModule")?;

        Ok(Self {
            handle,
            context: Arc::clone(context),
        })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.context
                .device
                .destroy_shader_module(self.handle, None)
        };
    }
}

/// Read a SPIR-V binary as aligned words
pub fn read_spirv(path: &Path) -> RenderResult<Vec<u32>> {
    let shader_error = |source| RenderError::ShaderLoad {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(shader_error)?;
    ash::util::read_spv(&mut file).map_err(shader_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_names_the_path() {
        let path = Path::new("shaders/does-not-exist.spv");
        let err = read_spirv(path).unwrap_err();
        assert!(matches!(err, RenderError::ShaderLoad { ref path, .. } if path.ends_with("does-not-exist.spv")));
    }

    #[test]
    fn words_are_read_in_native_order() {
        let path = std::env::temp_dir().join(format!("render-box-{}.spv", std::process::id()));
        {
            let mut file = File::create(&path).unwrap();
            file.write_all(&0x0723_0203u32.to_ne_bytes()).unwrap();
            file.write_all(&42u32.to_ne_bytes()).unwrap();
        }
        let words = read_spirv(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(words, vec![0x0723_0203, 42]);
    }

    #[test]
    fn truncated_binary_is_rejected() {
        let path = std::env::temp_dir().join(format!("render-box-odd-{}.spv", std::process::id()));
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        let result = read_spirv(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(result.is_err());
    }
}
