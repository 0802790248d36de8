// render-box: a minimal Vulkan renderer
//
// Backend wrappers live in `backend`; the frame loop is generic over the
// device and window traits in `frame_loop` and is driven by `Renderer` and
// `AppWindow` in the binary.

pub mod backend;
pub mod config;
pub mod error;
pub mod frame_loop;
pub mod frame_slots;
pub mod mesh;
pub mod renderer;
pub mod window;

pub use config::Config;
pub use error::{RenderError, RenderResult};
pub use frame_loop::{FrameLoop, FrameStats, LoopSettings};
pub use renderer::{Renderer, RendererSettings};
pub use window::AppWindow;
