//! metersrv - electricity meter acquisition over a shared RS-485 bus
//!
//! Polls a meter on a fixed, drift-free cadence, decodes its holding
//! registers through a [`RegisterMap`], and appends each reading to a local
//! CSV or JSON Lines log. Several metersrv processes can share one bus;
//! [`BusLock`] serializes their access.

pub mod bus_lock;
pub mod config;
pub mod decoder;
pub mod error;
pub mod reading;
pub mod record;
pub mod register_map;
pub mod scheduler;
pub mod sink;
pub mod status;
pub mod transport;

pub use bus_lock::{BusGuard, BusLock, LockBackend};
pub use config::MeterSrvConfig;
pub use decoder::{decode, DecodedValue};
pub use error::{MeterSrvError, Result};
pub use reading::{read_all, FieldFailurePolicy, Reading};
pub use register_map::{DecodeKind, RegisterMap, RegisterMapEntry};
pub use scheduler::{CycleOutcome, CycleOptions, ScheduleState, Scheduler, ServiceContext};
pub use sink::{FileSink, MemorySink, Sink};
pub use status::{StatusIndicator, StatusPanel};
pub use transport::{MemoryTransport, ModbusRtuTransport, Transport};

pub const SERVICE_NAME: &str = "metersrv";
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
