pub mod activity;
pub mod config;
pub mod device;
pub mod dns;
pub mod health;
pub mod lifecycle;
pub mod pages;
pub mod power;
pub mod provisioning;
pub mod reading;
pub mod storage;
pub mod upload;

#[cfg(test)]
mod testing;

pub use activity::ActivityIndicator;
pub use config::{Config, ConfigError, ConfigStore, Destination, LifecycleConfig};
pub use device::{DeviceError, DeviceResult, ResetRequested, SystemClock};
pub use lifecycle::{CycleError, Device, LifecycleController, Storage};
pub use power::{PowerController, SleepOutcome, WakeReason};
pub use provisioning::{
    access_point_name, network_names, PortalRequest, PortalResponse, ProvisioningController,
};
pub use reading::{Reading, ReadingStore};
pub use upload::UploadCache;
