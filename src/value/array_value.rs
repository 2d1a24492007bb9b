use serde::{Deserialize, Serialize};

use crate::value::{values_equal, Value};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArrayValue {
    values: Vec<Value>,
}

impl ArrayValue {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn contains(&self, needle: &Value) -> bool {
        self.values.iter().any(|value| values_equal(value, needle))
    }
}
