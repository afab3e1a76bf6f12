//! Push-to-talk voice assistant core — event bus, mode state machine, and
//! the ten collaborating services that turn key taps into recognized
//! speech, spoken replies, and screen context.
//!
//! `ptt-daemon` wires concrete platform collaborators (mic, speaker,
//! key-tap source, screen capture, STT/route backends) into the types
//! exposed here and drives the event loop.

pub mod config;
pub mod error;
pub mod event_bus;
pub mod interrupt;
pub mod mode_controller;
pub mod notifier;
pub mod playback;
pub mod recognition;
pub mod screenshot;
pub mod signal;
pub mod state_store;
pub mod translator;
pub mod types;

pub use error::{Error, Result};
pub use event_bus::EventBus;
pub use state_store::StateStore;
