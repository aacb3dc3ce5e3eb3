//! Case data: input, working variables and output.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON object map used for all data documents.
pub type DataMap = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseData {
    #[serde(default)]
    pub input: DataMap,
    #[serde(default)]
    pub variables: DataMap,
    #[serde(default)]
    pub output: DataMap,
}

impl CaseData {
    /// Variables start as a copy of the input.
    pub fn from_input(input: DataMap) -> Self {
        Self {
            variables: input.clone(),
            input,
            output: DataMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// Shallow merge: keys in `update` overwrite existing variables.
    pub fn merge(&mut self, update: &DataMap) {
        for (k, v) in update {
            self.variables.insert(k.clone(), v.clone());
        }
    }

    /// Variables as a JSON value, the document predicates are evaluated against.
    pub fn as_value(&self) -> Value {
        Value::Object(self.variables.clone())
    }

    /// Freeze the variables as the case output.
    pub fn finalize(&mut self) {
        self.output = self.variables.clone();
    }
}

/// Convert any JSON value into a data map; non-objects land under `"value"`.
pub fn into_data_map(value: Value) -> DataMap {
    match value {
        Value::Object(map) => map,
        Value::Null => DataMap::new(),
        other => {
            let mut map = DataMap::new();
            map.insert("value".into(), other);
            map
        }
    }
}
