//! Field-level validation errors, the channel reducers answer emitters
//! through. Always data, never exceptions, so the UI can render messages next
//! to the fields they belong to.

use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(transparent)]
pub struct ValidationErrors {
    pub fields: BTreeMap<String, Vec<String>>,
}

impl ValidationErrors {
    pub fn add(&mut self, field: &str, message: &str) {
        self.fields
            .entry(field.to_string())
            .or_default()
            .push(message.to_string());
    }

    pub fn unauthorized(what: &str) -> Self {
        let mut errors = Self::default();
        errors.add("unauthorized", what);
        errors
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn messages(&self, field: &str) -> &[String] {
        self.fields.get(field).map_or(&[], Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_a_flat_field_map() {
        let mut errors = ValidationErrors::default();
        errors.add("email", "already in use");
        errors.add("email", "looks wrong");

        let json = serde_json::to_value(&errors).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"email": ["already in use", "looks wrong"]})
        );
    }
}
