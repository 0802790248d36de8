// GPU frame timing with timestamp queries
//
// Two queries per swapchain slot. A slot's pair is only read back after the
// slot's fence has been waited on, so the results are always available.

use ash::vk;
use std::sync::Arc;

use super::GpuContext;
use crate::error::{RenderResult, VkResultExt};

pub struct GpuTimer {
    pool: vk::QueryPool,
    written: Vec<bool>,
    period_ns: f32,
    valid_bits: u32,
    context: Arc<GpuContext>,
}

impl GpuTimer {
    /// `None` when the render queue does not support timestamps
    pub fn new(context: &Arc<GpuContext>, slot_count: usize) -> RenderResult<Option<Self>> {
        if context.timestamp_valid_bits == 0 || slot_count == 0 {
            log::info!("GPU timestamps unsupported on the render queue");
            return Ok(None);
        }

        let pool_info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(2 * slot_count as u32);

        let pool = unsafe { context.device.create_query_pool(&pool_info, None) }
            .call("vkCreateQueryPool")?;

        Ok(Some(Self {
            pool,
            written: vec![false; slot_count],
            period_ns: context.properties.limits.timestamp_period,
            valid_bits: context.timestamp_valid_bits,
            context: Arc::clone(context),
        }))
    }

    pub fn cmd_begin(&self, command_buffer: vk::CommandBuffer, slot: usize) {
        let first = 2 * slot as u32;
        unsafe {
            let device = &self.context.device;
            device.cmd_reset_query_pool(command_buffer, self.pool, first, 2);
            device.cmd_write_timestamp(
                command_buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                self.pool,
                first,
            );
        }
    }

    pub fn cmd_end(&mut self, command_buffer: vk::CommandBuffer, slot: usize) {
        unsafe {
            self.context.device.cmd_write_timestamp(
                command_buffer,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                self.pool,
                2 * slot as u32 + 1,
            );
        }
        if let Some(written) = self.written.get_mut(slot) {
            *written = true;
        }
    }

    /// Milliseconds spent by the last submission on `slot`, if any.
    ///
    /// Call only after the slot's fence wait.
    pub fn read(&self, slot: usize) -> RenderResult<Option<f32>> {
        if !self.written.get(slot).copied().unwrap_or(false) {
            return Ok(None);
        }

        let mut timestamps = [0u64; 2];
        let result = unsafe {
            self.context.device.get_query_pool_results(
                self.pool,
                2 * slot as u32,
                2,
                &mut timestamps,
                vk::QueryResultFlags::TYPE_64,
            )
        };

        match result {
            Ok(()) => Ok(Some(elapsed_ms(
                timestamps[0],
                timestamps[1],
                self.valid_bits,
                self.period_ns,
            ))),
            Err(vk::Result::NOT_READY) => Ok(None),
            Err(e) => Err(e).call("vkGetQueryPoolResults"),
        }
    }
}

impl Drop for GpuTimer {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_query_pool(self.pool, None) };
    }
}

/// Tick delta in milliseconds, honouring counter wrap-around at `valid_bits`
pub fn elapsed_ms(start: u64, end: u64, valid_bits: u32, period_ns: f32) -> f32 {
    let mask = if valid_bits >= 64 {
        u64::MAX
    } else {
        (1u64 << valid_bits) - 1
    };
    let ticks = (end & mask).wrapping_sub(start & mask) & mask;
    (ticks as f64 * f64::from(period_ns) / 1_000_000.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_ticks_with_period() {
        // 2_000_000 ticks at 1 ns
        assert_eq!(elapsed_ms(1_000_000, 3_000_000, 64, 1.0), 2.0);
        // 1000 ticks at 83.333 ns
        let ms = elapsed_ms(0, 1000, 64, 83.333);
        assert!((ms - 0.083333).abs() < 1e-5);
    }

    #[test]
    fn handles_counter_wrap() {
        // 36 valid bits: end wrapped past the top
        let top = (1u64 << 36) - 10;
        assert_eq!(elapsed_ms(top, 10, 36, 1_000_000.0), 20.0);
    }

    #[test]
    fn ignores_bits_above_valid_range() {
        let garbage = 0xFFFF_0000_0000_0000;
        assert_eq!(elapsed_ms(garbage | 5, 1_000_005, 48, 1.0), 1.0);
    }
}
