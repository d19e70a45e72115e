pub mod config;
pub mod device;
pub mod error;
pub mod event_loop;
pub mod indexer;
pub mod naming;
pub mod retention;
pub mod supervisor;
pub mod tracker;
pub mod transfer;

pub use config::{AppConfig, Settings};
pub use device::{Device, DeviceConnector, DeviceEvent, DeviceFileMetadata, DeviceFileRef};
pub use error::Error;
pub use event_loop::{EventLoop, ScanReport};
pub use retention::{PurgeReport, RetentionPurger};
pub use supervisor::{ConnectionState, ConnectionSupervisor, Sleeper, ThreadSleeper};
pub use tracker::{TransferRecord, TransferTracker};
pub use transfer::{MediaTransferEngine, TransferOutcome};
