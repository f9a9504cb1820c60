//! Audio playback core for rhythm games.
//!
//! Two interchangeable mixer backends sit behind one generic engine: a
//! tempo backend built on kira, and a software mix bus over cpal that
//! decodes through symphonia and carries its own time-stretch stage.
//! On top of that, [`Sound`] models one loaded asset with background
//! loading, a seek protocol tuned for music scrubbing, and a playback
//! position interpolator that smooths the coarse readouts audio drivers
//! actually deliver.

pub mod backend;
pub mod config;
pub mod engine;
pub mod interpolator;
pub mod loader;
pub mod sniff;
pub mod sound;
pub mod util;

pub use backend::{Mixer, PlayParams, SoundDesc, SpeedMode, Voice};
pub use config::AudioConfig;
pub use engine::device::{DriverKind, OutputDevice};
pub use engine::{AnyEngine, Backend, EngineState, RestartPhase, SoundEngine};
pub use interpolator::PlaybackInterpolator;
pub use sound::Sound;
