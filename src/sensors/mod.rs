//! Sensor module: BLE links, decoding and fusion.

pub mod btle;
pub mod decoder;
pub mod erg;
pub mod fusion;
pub mod gate;
pub mod gatt;
pub mod manager;
pub mod profile;
pub mod simulated;
pub mod stop;
pub mod supervisor;
pub mod transport;
pub mod types;

pub use btle::BtleTransport;
pub use decoder::{
    CounterWidths, CyclingSample, DecodeError, DecoderConfig, HeartRateSample, PowerSample,
    Reading, RunningSample, TrainerSample,
};
pub use fusion::{FusionDiagnostics, FusionEngine};
pub use gate::ChannelGate;
pub use manager::{AcquisitionConfig, SensorCommand, SensorManager};
pub use profile::{ProfileKind, ProfileRegistry, ProfileRule, SensorProfile};
pub use simulated::{ControlBehavior, SimulatedDevice, SimulatedTransport};
pub use stop::{stop_pair, StopHandle, StopSignal, Stopped};
pub use supervisor::{LinkSupervisor, SupervisorConfig, SupervisorTiming};
pub use transport::{BleConnection, BleTransport, DeviceFilter, DeviceInfo, TransportError};
pub use types::{
    DataChannel, LinkState, LinkStatus, SensorError, SensorEvent, SensorRole, SessionClock, Sport,
};
