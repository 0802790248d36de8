// =============================================================================
// RENDER BOX - minimal Vulkan renderer
// =============================================================================
//
// FRAME FLOW:
// 1. Acquire swapchain image
// 2. Wait for the fence of that image's slot
// 3. Record barriers + draw into the slot's command buffer
// 4. Submit, waiting on acquire and signaling release + the slot fence
// 5. Present, waiting on release
// 6. Pump window events
//
// Any error is fatal: it is logged with its context chain and the process
// exits non-zero.
//
// =============================================================================

use anyhow::{Context, Result};
use std::process::ExitCode;

use render_box::{AppWindow, Config, FrameLoop, LoopSettings, Renderer, RendererSettings};

fn main() -> ExitCode {
    let config = Config::load();
    init_logging(&config);

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins over the configured level
fn init_logging(config: &Config) {
    let env = env_logger::Env::default().default_filter_or(config.debug.log_level.as_str());
    env_logger::Builder::from_env(env).init();
}

fn run(config: &Config) -> Result<()> {
    log::info!("Starting renderer");
    log::info!(
        "Window: {}x{}, present mode: {}",
        config.window.width,
        config.window.height,
        config.graphics.present_mode
    );

    let mut window = AppWindow::new(&config.window).context("Failed to create window")?;
    let extensions = window
        .required_extensions()
        .context("Failed to query surface extensions")?;
    let target = window.surface_target()?;

    let mut renderer = Renderer::new(RendererSettings::from_config(config), &extensions, &target)
        .context("Failed to initialize Vulkan")?;

    let mut frame_loop = FrameLoop::new(LoopSettings {
        recreate_swapchain: config.graphics.recreate_swapchain,
        show_fps: config.debug.show_fps,
    });
    let stats = frame_loop
        .run(&mut renderer, &mut window)
        .context("Frame loop failed")?;

    // The surface must go before the window it was created from
    drop(renderer);
    log::info!("Presented {} frames", stats.frames_presented);
    Ok(())
}
