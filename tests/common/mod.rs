//! Shared fixture for the integration tests: a controller wired to the
//! simulated crate, configured from a real settings file on disk.
#![allow(dead_code)]

use lappd_hv::controller::SequencingController;
use lappd_hv::device::{ChannelAddress, DeviceInterface, SimCrate};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Detector "1" channel addresses as allocated by the registry.
pub const PC: ChannelAddress = ChannelAddress { module: 1, index: 0 };
pub const MCP1: ChannelAddress = ChannelAddress { module: 1, index: 1 };
pub const MCP2: ChannelAddress = ChannelAddress { module: 1, index: 2 };

/// The end-to-end scenario settings: ramp 100 V/s, fall 50 V/s, bias -10 V,
/// detector "1" at pc=1200, mcp1=1100, mcp2=800.
pub const SETTINGS: &str = r#"
crate_addr = "192.168.46.50"
debug = true
ramp_rate = 100.0
fall_rate = 50.0
pc_off_bias = -10.0

[[detectors]]
id = "1"
set_v = { pc = 1200.0, mcp1 = 1100.0, mcp2 = 800.0 }
max_i = { pc = 0.0002, mcp1 = 0.0002, mcp2 = 0.0002 }
"#;

pub fn write_settings(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// Build a controller over a fresh simulated crate. The returned tempfile
/// keeps the settings file alive (reload operations re-read it).
pub async fn controller_with(
    contents: &str,
) -> (Arc<SequencingController>, Arc<SimCrate>, NamedTempFile) {
    let file = write_settings(contents);
    let sim = Arc::new(SimCrate::new());
    let device: Arc<dyn DeviceInterface> = sim.clone();
    let controller = SequencingController::initialize(file.path(), device)
        .await
        .unwrap();
    (Arc::new(controller), sim, file)
}
