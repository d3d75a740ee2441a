//! Auto phase control, keeping acquisition locked to the USB host's frame clock.
//!
//! On every USB start of frame we look at where the DMA writer is inside the frame. A writer
//! ahead of the target is running fast, so a positive error pulls the clock fraction down and
//! slows acquisition.

use tracing::debug;

use crate::SAMPLES_PER_FRAME;

// Tuned by trial and error, too much gain makes a one sample error an audible rate step
const P_COEFFICIENT: f32 = 3.0;
const I_COEFFICIENT: f32 = 0.3;
const I_RANGE: f32 = 500.0;
pub const MAX_CONTROL_DELTA: i32 = 500;
const LOCKIN_DELTA_ALLOWED: i32 = 3;

#[derive(Debug, Clone)]
pub struct PhaseController {
    active: bool,
    locked_on: bool,
    integrator: f32,
    frame_len: usize,
}

impl Default for PhaseController {
    fn default() -> Self {
        Self::new(SAMPLES_PER_FRAME)
    }
}

impl PhaseController {
    pub fn new(frame_len: usize) -> Self {
        Self {
            active: false,
            locked_on: false,
            integrator: 0.0,
            frame_len,
        }
    }

    pub fn start(&mut self) {
        self.active = true;
        self.locked_on = false;
        self.integrator = 0.0;
    }

    pub fn stop(&mut self) {
        self.active = false;
        self.locked_on = false;
    }

    pub fn locked_on(&self) -> bool {
        self.locked_on
    }

    /// Stay off exact half frame boundaries, those are when acquisition interrupts fire
    pub fn offset_target(&self) -> i32 {
        (self.frame_len * 3 >> 2) as i32
    }

    /// Called on USB start of frame with the DMA write position in samples. Returns the clock
    /// fraction adjustment, 0 while inactive.
    pub fn on_start_of_frame(&mut self, dma_offset: usize) -> i32 {
        if !self.active {
            return 0;
        }
        let error = dma_offset as i32 - self.offset_target();
        let locked_on = error.abs() <= LOCKIN_DELTA_ALLOWED;
        if locked_on != self.locked_on {
            debug!(locked_on, error, "phase lock changed");
        }
        self.locked_on = locked_on;

        let p_fraction = (-error as f32 * P_COEFFICIENT) as i32;
        self.integrator = (self.integrator - error as f32 * I_COEFFICIENT).clamp(-I_RANGE, I_RANGE);
        (p_fraction + self.integrator as i32).clamp(-MAX_CONTROL_DELTA, MAX_CONTROL_DELTA)
    }
}
