//! Kubernetes cluster bin-packing exporter
//!
//! The binary wires the watch caches, leader election and the bin-packing
//! collector from `binpacking-lib` behind the HTTP API defined here.

pub mod api;
pub mod config;
