//! Channel registry.
//!
//! Maps a typed `(detector, tap)` key to its device channel address and
//! caches the last-known channel state (setpoint, terminal voltage, switch
//! state). Built once at startup from a settings snapshot: each detector in
//! use gets three contiguous addresses on module 1 in fixed PC, MCP1, MCP2
//! order, and its per-tap current limits plus the shared ramp and fall rates
//! are pushed to the device during the build.
//!
//! `refresh` re-reads the cached fields from the device. A failed read for
//! an individual channel is logged and the previous cached value kept; the
//! cache exists for display and sequencing bookkeeping, so a partial read
//! must not take down the refresh.

use crate::config::Settings;
use crate::device::{ChannelAddress, DeviceInterface, SwitchState};
use crate::error::{HvError, HvResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Identifier of one LAPPD detector assembly, matching the settings file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DetectorId(String);

impl DetectorId {
    /// Wrap a detector identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as written in the settings file.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DetectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DetectorId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// One of the three voltage taps on a detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tap {
    /// Photocathode.
    Pc,
    /// First micro-channel plate.
    Mcp1,
    /// Second micro-channel plate.
    Mcp2,
}

impl Tap {
    /// All taps in channel-allocation order.
    pub const ALL: [Tap; 3] = [Tap::Pc, Tap::Mcp1, Tap::Mcp2];

    /// Address offset within a detector's three-channel block.
    fn offset(self) -> u8 {
        match self {
            Tap::Pc => 0,
            Tap::Mcp1 => 1,
            Tap::Mcp2 => 2,
        }
    }
}

impl fmt::Display for Tap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tap::Pc => write!(f, "pc"),
            Tap::Mcp1 => write!(f, "mcp1"),
            Tap::Mcp2 => write!(f, "mcp2"),
        }
    }
}

/// Composite channel key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelKey {
    /// Owning detector.
    pub detector: DetectorId,
    /// Tap within the detector.
    pub tap: Tap,
}

/// Cached state of one HV channel.
#[derive(Debug, Clone)]
pub struct Channel {
    /// Composite key of this channel.
    pub key: ChannelKey,
    /// Device address of this channel.
    pub address: ChannelAddress,
    /// Last commanded (or read-back) setpoint, in volts.
    pub setpoint_v: f64,
    /// Last measured terminal voltage, in volts.
    pub terminal_v: f64,
    /// Last known output relay state.
    pub switch: SwitchState,
}

/// Module slot the detector channels are allocated on.
const MODULE_SLOT: u8 = 1;

/// Registry of every HV channel in use.
pub struct ChannelRegistry {
    device: Arc<dyn DeviceInterface>,
    channels: RwLock<BTreeMap<ChannelKey, Channel>>,
    detector_order: Vec<DetectorId>,
}

impl ChannelRegistry {
    /// Build the registry from a settings snapshot, pushing current limits
    /// and slew rates to the device for every allocated channel.
    pub async fn build(settings: &Settings, device: Arc<dyn DeviceInterface>) -> HvResult<Self> {
        let mut channels = BTreeMap::new();
        let mut detector_order = Vec::with_capacity(settings.detectors.len());

        for (det_index, det) in settings.detectors.iter().enumerate() {
            let detector = DetectorId::new(&det.id);
            detector_order.push(detector.clone());

            for tap in Tap::ALL {
                let index = det_index as u8 * 3 + tap.offset();
                let address = ChannelAddress::new(MODULE_SLOT, index);
                let max_i = match tap {
                    Tap::Pc => det.max_i.pc,
                    Tap::Mcp1 => det.max_i.mcp1,
                    Tap::Mcp2 => det.max_i.mcp2,
                };

                device.write_current_limit(address, max_i).await?;
                device.write_ramp_rate(address, settings.ramp_rate).await?;
                device.write_fall_rate(address, settings.fall_rate).await?;

                tracing::debug!(%detector, %tap, %address, max_i, "allocated HV channel");

                let key = ChannelKey {
                    detector: detector.clone(),
                    tap,
                };
                channels.insert(
                    key.clone(),
                    Channel {
                        key,
                        address,
                        setpoint_v: 0.0,
                        terminal_v: 0.0,
                        switch: SwitchState::Unknown,
                    },
                );
            }
        }

        Ok(Self {
            device,
            channels: RwLock::new(channels),
            detector_order,
        })
    }

    /// Detector ids in allocation order.
    pub fn detector_ids(&self) -> &[DetectorId] {
        &self.detector_order
    }

    /// Look up one channel by key. Clones the cached record.
    pub async fn get(&self, detector: &DetectorId, tap: Tap) -> HvResult<Channel> {
        let channels = self.channels.read().await;
        channels
            .get(&ChannelKey {
                detector: detector.clone(),
                tap,
            })
            .cloned()
            .ok_or_else(|| HvError::UnknownDetector(detector.clone()))
    }

    /// All three channels of a detector in PC, MCP1, MCP2 order.
    pub async fn channels_of(&self, detector: &DetectorId) -> HvResult<[Channel; 3]> {
        let pc = self.get(detector, Tap::Pc).await?;
        let mcp1 = self.get(detector, Tap::Mcp1).await?;
        let mcp2 = self.get(detector, Tap::Mcp2).await?;
        Ok([pc, mcp1, mcp2])
    }

    /// Record a newly commanded setpoint in the cache.
    pub async fn set_setpoint(&self, detector: &DetectorId, tap: Tap, volts: f64) {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get_mut(&ChannelKey {
            detector: detector.clone(),
            tap,
        }) {
            channel.setpoint_v = volts;
        }
    }

    /// Record a newly commanded switch state in the cache.
    pub async fn set_switch(&self, detector: &DetectorId, tap: Tap, state: SwitchState) {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get_mut(&ChannelKey {
            detector: detector.clone(),
            tap,
        }) {
            channel.switch = state;
        }
    }

    /// Re-read terminal voltage, setpoint and switch state for all three
    /// channels of a detector.
    ///
    /// Individual read failures are logged at `warn` and the cached value is
    /// kept; the error is not escalated.
    pub async fn refresh(&self, detector: &DetectorId) -> HvResult<()> {
        // Validate the detector id up front so a typo still fails loudly.
        let current = self.channels_of(detector).await?;

        for cached in current {
            let address = cached.address;
            let tap = cached.key.tap;

            let mut updated = cached;
            match self.device.read_terminal_voltage(address).await {
                Ok(volts) => updated.terminal_v = volts,
                Err(err) => {
                    tracing::warn!(%detector, %tap, %address, %err, "terminal read failed; keeping cached value");
                }
            }
            match self.device.read_voltage(address).await {
                Ok(volts) => updated.setpoint_v = volts,
                Err(err) => {
                    tracing::warn!(%detector, %tap, %address, %err, "setpoint read failed; keeping cached value");
                }
            }
            match self.device.read_switch(address).await {
                Ok(state) => updated.switch = state,
                Err(err) => {
                    tracing::warn!(%detector, %tap, %address, %err, "switch read failed; keeping cached value");
                }
            }

            let mut channels = self.channels.write().await;
            channels.insert(updated.key.clone(), updated);
        }
        Ok(())
    }
}
