// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printline Print: locate the network 3-D printer, deposit a sliced job on
// it over implicit FTPS, and start it over MQTT.  The wire protocols are
// synchronous with explicit timeouts; async callers wrap them in
// `spawn_blocking`.

pub mod control;
pub mod discovery;
pub mod ftps_client;
pub mod mqtt;
pub mod wire;

pub use control::{ControlChannel, DeviceControlClient, DeviceSession, FirmwareCapabilities};
pub use discovery::{DeviceLocator, DiscoveryNetwork, LanNetwork, LocatorSettings};
pub use mqtt::MqttSession;
pub use wire::Wire;
