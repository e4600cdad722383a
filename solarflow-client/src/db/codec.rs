use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use super::record_store::{Document, Record, StoreError};

/// Serialize a domain record into a store document.
pub fn to_document<T: Serialize>(value: &T) -> Result<Document, StoreError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::Codec(format!("expected a JSON object, got {other}"))),
        Err(e) => Err(StoreError::Codec(e.to_string())),
    }
}

pub fn from_document<T: DeserializeOwned>(doc: &Document) -> Result<T, StoreError> {
    serde_json::from_value(Value::Object(doc.clone())).map_err(|e| StoreError::Codec(e.to_string()))
}

/// Decode a record body, naming the record in the error.
pub fn decode_record<T: DeserializeOwned>(record: &Record) -> Result<T, StoreError> {
    from_document(&record.fields).map_err(|e| StoreError::Codec(format!("{}: {e}", record.key)))
}

/// Shallow merge: top-level fields of `patch` replace those in `base`.
pub fn merge_into(base: &mut Document, patch: Document) {
    for (k, v) in patch {
        base.insert(k, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_replaces_only_patched_fields() {
        let mut base = json!({ "mode": "auto", "state": true }).as_object().unwrap().clone();
        let patch = json!({ "mode": "manual" }).as_object().unwrap().clone();

        merge_into(&mut base, patch);

        assert_eq!(base.get("mode"), Some(&json!("manual")));
        assert_eq!(base.get("state"), Some(&json!(true)));
    }

    #[test]
    fn to_document_rejects_non_objects() {
        assert!(matches!(to_document(&42), Err(StoreError::Codec(_))));
    }
}
