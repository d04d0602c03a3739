//! Schedulers, guidance, and the seeded noise source for latentkit.
//!
//! Everything here is pure orchestration math over `burn` tensors: noise
//! schedules, the PLMS and DPM-Solver++ denoising state machines,
//! classifier-free guidance fusion, and the deterministic normal sampler
//! that feeds every noise source of a generation request.

pub mod dpm;
pub mod guidance;
pub mod plms;
pub mod rng;
pub mod schedule;

pub use dpm::DpmSolverScheduler;
pub use guidance::{apply_guidance, apply_instruct_guidance};
pub use plms::PlmsScheduler;
pub use rng::NoiseGenerator;
pub use schedule::{
    inference_time_steps, weighted_sum, BetaSchedule, Scheduler, SchedulerConfig, SchedulerKind,
    DEFAULT_TRAIN_STEP_COUNT,
};
