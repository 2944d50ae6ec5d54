//! Runtime layer: options, filesystem layout, and the pod-facing API.

pub mod core;
pub mod layout;
pub mod options;
pub mod rt_impl;
pub mod types;
