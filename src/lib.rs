//! # LAPPD HV Control Library
//!
//! Core library for supervising a multi-channel high-voltage power module
//! driving LAPPD photo-detector assemblies. Each detector has three coupled,
//! order-dependent voltage taps (photocathode, MCP1, MCP2); the heart of the
//! crate is the sequencing controller that ramps them up and down safely,
//! validates operator setpoints against physical bounds, and reconciles
//! logical on/off intent with hardware-reported state.
//!
//! The library is front-end agnostic: the bundled binary is a CLI, but any
//! host (service, GUI, test harness) drives the same operation API and can
//! observe ramps through the broadcast event stream.
//!
//! ## Crate Structure
//!
//! - **`config`**: settings snapshot loading (TOML via figment) and semantic
//!   validation.
//! - **`safety`**: the pure setpoint safety rules applied before any voltage
//!   write.
//! - **`device`**: the abstract device command interface plus the simulated
//!   crate backend used for hardware-free runs and tests.
//! - **`registry`**: typed `(detector, tap)` channel map with cached
//!   last-known state and soft-failing bulk refresh.
//! - **`events`**: sequencing progress events and the cancellable wait
//!   primitive.
//! - **`controller`**: the sequencing state machine and emergency shutdown.
//! - **`error`**: the `HvError` taxonomy shared across the crate.

pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod events;
pub mod registry;
pub mod safety;
