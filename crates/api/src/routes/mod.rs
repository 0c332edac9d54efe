//! HTTP Route Handlers

pub mod data;
pub mod sensors;
pub mod system;
