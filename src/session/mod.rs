mod deployment;
mod device_session;
mod duplex_link;
mod failure_policy;
mod inventory;
#[cfg(test)]
pub(crate) mod testing;

pub use device_session::DeviceSession;
pub use failure_policy::FailurePolicy;
pub use inventory::AttributeSpec;
