//! Cache reconciliation after the server accepts a mutation
//!
//! Computes the next full collection payload; the caller writes it back
//! wholesale. The server's answer wins over whatever the cache held.

use serde_json::{Map, Value};

use crate::transport::Method;

/// Next snapshot of a collection after an accepted mutation.
///
/// - an array response replaces the collection
/// - POST/PUT/PATCH upsert the record by `id_field`
/// - DELETE removes it
pub fn apply_mutation(
    cached: Option<&Value>,
    method: Method,
    record_id: Option<&str>,
    request_body: Option<&Value>,
    response_body: &Value,
    id_field: &str,
) -> Value {
    if response_body.is_array() {
        return response_body.clone();
    }

    let mut records: Vec<Value> = match cached {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };

    let response_record = response_body.as_object().filter(|o| !o.is_empty());
    let request_record = request_body.and_then(|b| b.as_object());

    let target_id = record_id
        .map(|s| s.to_string())
        .or_else(|| response_record.and_then(|r| id_of(r, id_field)))
        .or_else(|| request_record.and_then(|r| id_of(r, id_field)));

    let position = target_id.as_ref().and_then(|id| {
        records.iter().position(|rec| {
            rec.as_object()
                .and_then(|o| id_of(o, id_field))
                .map(|rid| &rid == id)
                .unwrap_or(false)
        })
    });

    match method {
        Method::Delete => {
            if let Some(pos) = position {
                records.remove(pos);
            }
        }
        Method::Post | Method::Put | Method::Patch => {
            let next = match (response_record, request_record) {
                (Some(resp), _) => Some(Value::Object(resp.clone())),
                (None, Some(req)) => {
                    let mut merged = match (method, position) {
                        (Method::Patch, Some(pos)) => {
                            records[pos].as_object().cloned().unwrap_or_default()
                        }
                        _ => Map::new(),
                    };
                    for (k, v) in req {
                        merged.insert(k.clone(), v.clone());
                    }
                    if let Some(id) = &target_id {
                        merged
                            .entry(id_field.to_string())
                            .or_insert_with(|| Value::String(id.clone()));
                    }
                    Some(Value::Object(merged))
                }
                (None, None) => None,
            };

            match (next, position) {
                (Some(record), Some(pos)) => records[pos] = record,
                (Some(record), None) => records.push(record),
                (None, _) => {}
            }
        }
        Method::Get => {}
    }

    Value::Array(records)
}

/// String form of a record id; numbers and strings compare equal ("42" == 42)
fn id_of(record: &Map<String, Value>, id_field: &str) -> Option<String> {
    match record.get(id_field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_post_appends_server_record() {
        let cached = json!([{"id": 1, "plate": "AB-123"}]);
        let next = apply_mutation(
            Some(&cached),
            Method::Post,
            None,
            Some(&json!({"plate": "CD-456", "tempId": "t-1"})),
            &json!({"id": 2, "plate": "CD-456"}),
            "id",
        );
        assert_eq!(
            next,
            json!([{"id": 1, "plate": "AB-123"}, {"id": 2, "plate": "CD-456"}])
        );
    }

    #[test]
    fn test_put_replaces_matching_record() {
        let cached = json!([{"id": 1, "plate": "AB-123"}, {"id": 2, "plate": "X"}]);
        let next = apply_mutation(
            Some(&cached),
            Method::Put,
            Some("2"),
            Some(&json!({"plate": "Y"})),
            &json!({"id": 2, "plate": "Y", "updatedAt": "now"}),
            "id",
        );
        assert_eq!(
            next,
            json!([{"id": 1, "plate": "AB-123"}, {"id": 2, "plate": "Y", "updatedAt": "now"}])
        );
    }

    #[test]
    fn test_patch_merges_request_when_response_is_empty() {
        let cached = json!([{"id": "v1", "plate": "AB-123", "active": true}]);
        let next = apply_mutation(
            Some(&cached),
            Method::Patch,
            Some("v1"),
            Some(&json!({"active": false})),
            &Value::Null,
            "id",
        );
        assert_eq!(next, json!([{"id": "v1", "plate": "AB-123", "active": false}]));
    }

    #[test]
    fn test_delete_removes_record() {
        let cached = json!([{"id": 1}, {"id": 2}]);
        let next = apply_mutation(
            Some(&cached),
            Method::Delete,
            Some("1"),
            None,
            &Value::Null,
            "id",
        );
        assert_eq!(next, json!([{"id": 2}]));
    }

    #[test]
    fn test_array_response_replaces_collection() {
        let next = apply_mutation(
            Some(&json!([{"id": 1}])),
            Method::Post,
            None,
            None,
            &json!([{"id": 9}]),
            "id",
        );
        assert_eq!(next, json!([{"id": 9}]));
    }

    #[test]
    fn test_missing_cache_starts_empty() {
        let next = apply_mutation(
            None,
            Method::Post,
            None,
            Some(&json!({"liters": 40})),
            &json!({"id": 5, "liters": 40}),
            "id",
        );
        assert_eq!(next, json!([{"id": 5, "liters": 40}]));
    }
}
