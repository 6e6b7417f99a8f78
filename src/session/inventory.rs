use crate::api::domain::InventoryAttribute;
use crate::app_config::AppConfig;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;

pub const ROOTFS_IMAGE_VERSION: &str = "rootfs-image.version";
pub const DEVICE_TYPE: &str = "device_type";
pub const TIME: &str = "time";

/// An inventory attribute configured as `name:value1|value2|...`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "String")]
pub struct AttributeSpec {
    name: String,
    values: Vec<String>,
}

impl AttributeSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fans the values out over the fleet, device `index` always gets the same one.
    pub fn value_for_index(&self, index: u64) -> &str {
        let position = (index % self.values.len() as u64) as usize;
        &self.values[position]
    }

    pub fn random_value<R: Rng + ?Sized>(&self, rng: &mut R) -> &str {
        &self.values[rng.gen_range(0..self.values.len())]
    }
}

impl TryFrom<String> for AttributeSpec {
    type Error = AttributeSpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let Some((name, values)) = value.split_once(':') else {
            return Err(AttributeSpecError(value));
        };

        let name = name.trim();
        if name.is_empty() {
            return Err(AttributeSpecError(value));
        }

        Ok(AttributeSpec {
            name: name.to_string(),
            values: values.split('|').map(str::to_string).collect(),
        })
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("malformed inventory attribute '{0}', expected 'name:value1|value2'")]
pub struct AttributeSpecError(String);

/// Assembles what a device reports about itself right now.
pub fn snapshot<R: Rng + ?Sized>(config: &AppConfig, index: u64, artifact_name: &str, now: DateTime<Utc>, rng: &mut R) -> Vec<InventoryAttribute> {
    let inventory = config.inventory();
    let mut attributes = Vec::with_capacity(3 + inventory.attributes().len() + inventory.random_attributes().len());

    attributes.push(InventoryAttribute::new(ROOTFS_IMAGE_VERSION, artifact_name));
    attributes.push(InventoryAttribute::new(DEVICE_TYPE, config.device().device_type()));

    attributes.extend(
        inventory
            .attributes()
            .iter()
            .map(|spec| InventoryAttribute::new(spec.name(), spec.value_for_index(index))),
    );
    attributes.extend(
        inventory
            .random_attributes()
            .iter()
            .map(|spec| InventoryAttribute::new(spec.name(), spec.random_value(rng))),
    );

    attributes.push(InventoryAttribute::new(TIME, now.timestamp()));
    attributes
}
