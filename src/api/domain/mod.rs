mod auth;
mod deployment;
mod inventory_attribute;

pub use auth::{AuthRequest, Credential, SignedAuthRequest};
pub use deployment::{DeploymentInstructions, DeploymentLog, DeploymentNextRequest, DeploymentPhase, LogMessage, StatusReport};
pub use inventory_attribute::InventoryAttribute;

#[cfg(test)]
pub use deployment::{ArtifactInfo, ArtifactSource};
#[cfg(test)]
pub use inventory_attribute::AttributeValue;
