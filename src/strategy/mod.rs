//! Strategy layer: rolling statistics, momentum oscillator, and the
//! flush-boundary volume engine.

pub mod engine;
pub mod oscillator;
pub mod rolling;

pub use engine::{EngineMetrics, EnginePhase, VolumeEngine};
pub use oscillator::PriceOscillator;
pub use rolling::RollingStats;
