pub mod app_config;
pub mod broker;
pub mod dispatch_worker;
pub mod observability;
pub mod store;

pub use app_config::{AppConfig, DEFAULT_CONFIG_PATHS, ENV_PREFIX};
pub use broker::{BrokerConfig, BrokerType};
pub use dispatch_worker::{BeatConfig, DispatchConfig, WorkerConfig};
pub use observability::ObservabilityConfig;
pub use store::{StoreConfig, StoreType};
