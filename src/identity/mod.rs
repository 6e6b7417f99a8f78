mod address;
mod key_store;

pub use address::{DeviceAddress, DeviceIdentity, MacPrefix};
pub use key_store::{DeviceKey, KeyError, KeyStore};
