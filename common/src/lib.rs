pub mod config;
pub mod controller;
pub mod display;
pub mod error;
pub mod store;
pub mod time;
pub mod types;

pub use config::{Color, Configuration, ControllerTiming, Dim, NightOff};
pub use controller::{ModeController, TickOutcome};
pub use display::{
    indicator_frame, render, ring_frame, NetworkIndicator, RenderInstruction, RenderSink,
    RING_PIXELS,
};
pub use error::{ClockError, StorageError};
pub use store::{BlobStorage, ConfigStore, MemoryStorage, MAX_CONFIG_BLOB_BYTES};
pub use time::{adjust, LocalTime, RawTime, TimeSource};
pub use types::{
    ColorUpdate, ConfigDocument, ConfigUpdate, ControllerStatus, FieldGroup, Mode,
    MutationReport, ProvisioningRequest,
};
