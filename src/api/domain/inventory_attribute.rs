use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryAttribute {
    pub name: String,
    pub value: AttributeValue,
}

impl InventoryAttribute {
    pub fn new(name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        InventoryAttribute {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Text(String),
    Number(i64),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Number(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_text_and_number_values_untagged() -> Result<(), serde_json::Error> {
        let attributes = vec![InventoryAttribute::new("device_type", "qemux86-64"), InventoryAttribute::new("time", 1_700_000_000i64)];

        let json = serde_json::to_string(&attributes)?;

        assert_eq!(json, r#"[{"name":"device_type","value":"qemux86-64"},{"name":"time","value":1700000000}]"#);
        Ok(())
    }
}
