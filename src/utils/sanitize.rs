use serde_json::Value;

/// Sanitizes sensitive fields in JSON payloads for logging
pub fn sanitize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sanitized = serde_json::Map::new();
            for (key, val) in map {
                let sanitized_val = if is_sensitive_field(key) {
                    mask_value(val)
                } else {
                    sanitize_json(val)
                };
                sanitized.insert(key.clone(), sanitized_val);
            }
            Value::Object(sanitized)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sanitize_json).collect()),
        _ => value.clone(),
    }
}

fn is_sensitive_field(key: &str) -> bool {
    let key = key.to_lowercase().replace(['-', '_'], "");
    matches!(
        key.as_str(),
        "password" | "secret" | "secretkey" | "token" | "apikey" | "authorization" | "signature"
    )
}

fn mask_value(value: &Value) -> Value {
    match value {
        Value::String(s) if s.chars().count() > 8 => {
            let chars: Vec<char> = s.chars().collect();
            let start: String = chars[..4].iter().collect();
            let end: String = chars[chars.len() - 4..].iter().collect();
            Value::String(format!("{}****{}", start, end))
        }
        _ => Value::String("****".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_secret_key() {
        let input = json!({
            "secret_key": "8gBm/:&EnhH.1/q",
            "totalPrice": "500.00"
        });

        let sanitized = sanitize_json(&input);
        assert_eq!(sanitized["secret_key"], "8gBm****.1/q");
        assert_eq!(sanitized["totalPrice"], "500.00");
    }

    #[test]
    fn test_sanitize_nested_signature() {
        let input = json!({
            "payment": {
                "signature": "5DZywcrTKD0gia/rsSMcrRHmJl+4Tbol6S+lWgdJ94E=",
                "transaction_uuid": "abc-123"
            },
            "headers": [{"Authorization": "Key abc"}]
        });

        let sanitized = sanitize_json(&input);
        assert!(sanitized["payment"]["signature"].as_str().unwrap().contains("****"));
        assert_eq!(sanitized["payment"]["transaction_uuid"], "abc-123");
        assert_eq!(sanitized["headers"][0]["Authorization"], "****");
    }
}
