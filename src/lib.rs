//! Scenario evaluation of vision-language robot controllers inside a
//! generative world model.
//!
//! A [`runner::ScenarioRunner`] chains world-model clips: every step renders
//! a clip, extracts its last frame, asks a [`vlm::VlmBackend`] for the next
//! action and feeds that action into the following clip. Finished
//! trajectories are scored by the evaluators in [`evaluation`].

pub mod config;
pub mod error;
pub mod evaluation;
pub mod frame;
pub mod judge;
pub mod loader;
pub mod models;
pub mod output;
pub mod prompt;
pub mod report;
pub mod runner;
pub mod vlm;
pub mod world_model;
