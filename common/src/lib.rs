pub mod api;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod hal;
pub mod page;
pub mod registry;
pub mod schedule;
pub mod storage;
pub mod tasks;
pub mod types;

pub use api::{HttpRequest, Method, Reply, Route};
pub use clock::{Clock, ClockSnapshot, ManualRtc, Rtc, SoftRtc};
pub use config::{NetworkConfig, RuntimeConfig, SchedulerConfig};
pub use engine::{Engine, StatusSnapshot, TickReport};
pub use error::{ClockError, ErrorKind, PinError, Rejection, SchedulerError, StorageError};
pub use hal::{OutputFactory, OutputPin, SimBoard, SimPin};
pub use registry::DeviceRegistry;
pub use schedule::{window_contains, Drive, TimeWindow};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use tasks::TaskStore;
pub use types::{Device, PinRef, Recurrence, Task, TimeOfDay};
