// Frame loop - acquire, throttle, record, submit, present, poll
//
// The loop is written against two small traits so it can be driven by the
// real renderer and window or by scripted doubles in tests.
//
// Reuse rule: nothing indexed by an image index is touched until that
// index's fence has been waited on in the current iteration. The only way
// to get a ClaimedSlot, which record/submit/present require, is through
// that wait.

use std::time::{Duration, Instant};

use crate::error::{RenderError, RenderResult};

/// Simulation time added per frame
pub const TIME_STEP: f32 = 0.02;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    pub suboptimal: bool,
}

/// Per-frame values handed to recording
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameInput {
    pub frame_number: u64,
    pub time: f32,
}

/// Proof that the fence of image `index` was waited on this iteration
#[derive(Debug)]
pub struct ClaimedSlot {
    index: u32,
}

impl ClaimedSlot {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn slot(&self) -> usize {
        self.index as usize
    }
}

/// GPU side of the loop
pub trait FrameDevice {
    /// Number of swapchain images, i.e. per-slot bundles
    fn image_count(&self) -> usize;

    /// Next presentable image; the acquire semaphore is signaled once it is free
    fn acquire_next_image(&mut self) -> RenderResult<AcquiredImage>;

    /// Wait on and reset the fence for `index`. Returns the GPU time of the
    /// previous submission on that slot when timing is enabled.
    fn wait_for_slot(&mut self, index: u32) -> RenderResult<Option<f32>>;

    fn record(&mut self, slot: &ClaimedSlot, input: &FrameInput) -> RenderResult<()>;

    fn submit(&mut self, slot: &ClaimedSlot) -> RenderResult<()>;

    /// Returns whether the chain is suboptimal
    fn present(&mut self, slot: ClaimedSlot) -> RenderResult<bool>;

    fn recreate_swapchain(&mut self, width: u32, height: u32) -> RenderResult<()>;

    fn wait_idle(&mut self) -> RenderResult<()>;
}

/// Window side of the loop
pub trait EventPump {
    /// Process pending events without blocking
    fn poll_events(&mut self) -> RenderResult<()>;

    fn close_requested(&self) -> bool;

    fn framebuffer_size(&self) -> (u32, u32);

    /// Size from the most recent resize since the last call
    fn take_resize(&mut self) -> Option<(u32, u32)>;

    fn report_fps(&mut self, _fps: f32, _frame_ms: f32) {}
}

#[derive(Clone, Copy, Debug)]
pub struct LoopSettings {
    pub recreate_swapchain: bool,
    pub show_fps: bool,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            recreate_swapchain: true,
            show_fps: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameStats {
    pub frames_presented: u64,
    pub suboptimal_frames: u64,
    pub swapchain_recreations: u64,
    pub last_gpu_time_ms: Option<f32>,
}

struct FpsCounter {
    window_start: Instant,
    frames: u32,
}

impl FpsCounter {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            frames: 0,
        }
    }

    /// (fps, average frame ms) once per second
    fn tick(&mut self) -> Option<(f32, f32)> {
        self.frames += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed < Duration::from_secs(1) {
            return None;
        }
        let seconds = elapsed.as_secs_f32();
        let fps = self.frames as f32 / seconds;
        let frame_ms = seconds * 1000.0 / self.frames as f32;
        self.frames = 0;
        self.window_start = Instant::now();
        Some((fps, frame_ms))
    }
}

pub struct FrameLoop {
    settings: LoopSettings,
    stats: FrameStats,
    frame_number: u64,
    fps: FpsCounter,
}

impl FrameLoop {
    pub fn new(settings: LoopSettings) -> Self {
        Self {
            settings,
            stats: FrameStats::default(),
            frame_number: 0,
            fps: FpsCounter::new(),
        }
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    /// Render until the window asks to close, then drain the device.
    ///
    /// The device is waited idle exactly once on the way out, whether the
    /// loop ended normally or with an error.
    pub fn run<D, E>(&mut self, device: &mut D, events: &mut E) -> RenderResult<FrameStats>
    where
        D: FrameDevice,
        E: EventPump,
    {
        log::info!("Entering frame loop");

        let result = self.run_until_closed(device, events);
        let idle = device.wait_idle();
        result?;
        idle?;

        log::info!(
            "Frame loop finished: {} frames presented, {} suboptimal, {} swapchain recreations",
            self.stats.frames_presented,
            self.stats.suboptimal_frames,
            self.stats.swapchain_recreations
        );
        if let Some(ms) = self.stats.last_gpu_time_ms {
            log::info!("Last GPU frame time: {:.3} ms", ms);
        }

        Ok(self.stats.clone())
    }

    fn run_until_closed<D, E>(&mut self, device: &mut D, events: &mut E) -> RenderResult<()>
    where
        D: FrameDevice,
        E: EventPump,
    {
        while !events.close_requested() {
            let (width, height) = events.framebuffer_size();
            if width == 0 || height == 0 {
                // Minimised: nothing to present to
                std::thread::sleep(Duration::from_millis(10));
                events.poll_events()?;
                continue;
            }

            if let Some((width, height)) = events.take_resize() {
                if self.settings.recreate_swapchain {
                    self.recreate(device, width, height)?;
                }
            }

            match self.render_frame(device) {
                Ok(()) => {}
                Err(RenderError::SwapchainOutOfDate) if self.settings.recreate_swapchain => {
                    log::debug!("Swapchain out of date");
                    let (width, height) = events.framebuffer_size();
                    self.recreate(device, width, height)?;
                }
                Err(e) => return Err(e),
            }

            if let Some((fps, frame_ms)) = self.fps.tick() {
                if self.settings.show_fps {
                    log::debug!("{:.0} FPS ({:.2} ms)", fps, frame_ms);
                    events.report_fps(fps, frame_ms);
                }
            }

            events.poll_events()?;
        }
        Ok(())
    }

    /// One acquire/throttle/record/submit/present cycle
    pub fn render_frame<D: FrameDevice>(&mut self, device: &mut D) -> RenderResult<()> {
        let acquired = device.acquire_next_image()?;

        let count = device.image_count();
        if acquired.index as usize >= count {
            return Err(RenderError::InvalidImageIndex {
                index: acquired.index,
                count,
            });
        }

        if let Some(ms) = device.wait_for_slot(acquired.index)? {
            self.stats.last_gpu_time_ms = Some(ms);
        }
        let slot = ClaimedSlot {
            index: acquired.index,
        };

        let input = FrameInput {
            frame_number: self.frame_number,
            time: self.frame_number as f32 * TIME_STEP,
        };
        device.record(&slot, &input)?;
        device.submit(&slot)?;
        self.frame_number += 1;

        let present_suboptimal = device.present(slot)?;

        self.stats.frames_presented += 1;
        if acquired.suboptimal || present_suboptimal {
            self.stats.suboptimal_frames += 1;
        }
        Ok(())
    }

    fn recreate<D: FrameDevice>(&mut self, device: &mut D, width: u32, height: u32) -> RenderResult<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        device.recreate_swapchain(width, height)?;
        self.stats.swapchain_recreations += 1;
        Ok(())
    }
}
