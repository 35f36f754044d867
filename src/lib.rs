pub mod api;
pub mod calendar;
pub mod cli;
pub mod core;
pub mod correlation;
pub mod google;
pub mod jobs;
pub mod provider;
pub mod resilience;
pub mod service;
pub mod subscription;
pub mod sync;
