//! Payload redaction and record-field truncation applied before a
//! [`TaskRecord`](store::TaskRecord) is handed to the Task Store.

const PAYLOAD_EXCERPT_LIMIT: usize = 500;
const ERROR_MIDDLE_LIMIT: usize = 3000;
const REDACTED: &str = "<redacted>";

/// Blanks out a configured set of field names anywhere they appear in a
/// JSON payload before it is persisted. Field names are matched at any
/// nesting depth, not just the top level, since task payloads are
/// free-form.
#[derive(Clone, Default)]
pub struct PayloadRedactor {
    secret_fields: Vec<String>,
}

impl PayloadRedactor {
    pub fn new(secret_fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            secret_fields: secret_fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn redact(&self, payload: &serde_json::Value) -> serde_json::Value {
        let mut out = payload.clone();
        self.redact_in_place(&mut out);
        out
    }

    fn redact_in_place(&self, value: &mut serde_json::Value) {
        match value {
            serde_json::Value::Object(map) => {
                for (key, v) in map.iter_mut() {
                    if self.secret_fields.iter().any(|f| f == key) {
                        *v = serde_json::Value::String(REDACTED.to_string());
                    } else {
                        self.redact_in_place(v);
                    }
                }
            }
            serde_json::Value::Array(items) => {
                for item in items.iter_mut() {
                    self.redact_in_place(item);
                }
            }
            _ => {}
        }
    }
}

/// Truncates a payload rendering to the 500-char excerpt used in logs and
/// listener diagnostics (the stored `payload` field itself is the redacted
/// JSON value, not this excerpt).
pub fn truncate_payload_excerpt(payload: &serde_json::Value) -> String {
    let rendered = payload.to_string();
    truncate_end(&rendered, PAYLOAD_EXCERPT_LIMIT)
}

/// Truncates an error string's middle to fit the 3,000-char limit named in
/// the external interfaces, keeping a prefix and suffix so the start and
/// end of long diagnostics are still legible.
pub fn truncate_error_middle(error: &str) -> String {
    if error.len() <= ERROR_MIDDLE_LIMIT {
        return error.to_string();
    }
    let half = (ERROR_MIDDLE_LIMIT - 5) / 2;
    let prefix_end = floor_char_boundary(error, half.min(error.len()));
    let suffix_start = ceil_char_boundary(error, error.len().saturating_sub(half));
    format!("{} ... {}", &error[..prefix_end], &error[suffix_start..])
}

fn truncate_end(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        s.to_string()
    } else {
        let end = floor_char_boundary(s, limit);
        format!("{}...", &s[..end])
    }
}

/// The largest byte index `<= index` that lands on a UTF-8 char boundary.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut idx = index.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// The smallest byte index `>= index` that lands on a UTF-8 char boundary.
fn ceil_char_boundary(s: &str, index: usize) -> usize {
    let mut idx = index.min(s.len());
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_nested_secret_fields() {
        let redactor = PayloadRedactor::new(["password"]);
        let payload = serde_json::json!({
            "username": "alice",
            "auth": { "password": "hunter2" },
        });
        let redacted = redactor.redact(&payload);
        assert_eq!(redacted["auth"]["password"], REDACTED);
        assert_eq!(redacted["username"], "alice");
    }

    #[test]
    fn error_middle_truncation_preserves_bounds() {
        let long = "a".repeat(10_000);
        let truncated = truncate_error_middle(&long);
        assert!(truncated.len() < long.len());
        assert!(truncated.starts_with('a'));
        assert!(truncated.ends_with('a'));
    }

    #[test]
    fn short_error_is_unchanged() {
        assert_eq!(truncate_error_middle("short"), "short");
    }

    #[test]
    fn error_middle_truncation_does_not_split_a_multibyte_char_at_the_cut() {
        // "€" is 3 bytes; repeating it straddles the truncation limit at
        // every possible byte offset so any un-guarded slice would panic.
        let long = "€".repeat(2000);
        let truncated = truncate_error_middle(&long);
        assert!(truncated.len() < long.len());
        assert!(truncated.starts_with('€'));
        assert!(truncated.ends_with('€'));
    }

    #[test]
    fn payload_excerpt_truncation_does_not_split_a_multibyte_char_at_the_cut() {
        let payload = serde_json::json!({ "note": "€".repeat(400) });
        let excerpt = truncate_payload_excerpt(&payload);
        assert!(excerpt.ends_with("..."));
    }
}
