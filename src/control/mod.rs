//! Control layer exposing device state to external tooling.

/// High-level control API for a device.
pub mod api;
/// Simulated host driving IO cycles.
pub mod sim;
/// Ratatui-based developer console.
pub mod ui;
