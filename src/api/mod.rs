mod client;
pub mod device_api;
pub mod domain;
mod http_device_api;

pub use client::new_client;
pub use device_api::{ApiError, DeviceApi};
pub use http_device_api::HttpDeviceApi;
