//! Minimal JSON path lookup (`$.a.b[0]`)

use serde_json::Value;

/// Resolve a dotted JSON path against a value.
///
/// Supports `$` (the whole document), `.field`, `['field']` and `[index]`
/// steps. A leading `$` is optional. Returns `None` when any step misses.
pub fn resolve<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for step in parse_steps(path)? {
        current = match step {
            Step::Field(name) => current.as_object()?.get(&name)?,
            Step::Index(index) => current.as_array()?.get(index)?,
        };
    }
    Some(current)
}

enum Step {
    Field(String),
    Index(usize),
}

fn parse_steps(path: &str) -> Option<Vec<Step>> {
    let path = path.trim();
    let path = path.strip_prefix('$').unwrap_or(path);
    let mut steps = Vec::new();
    let mut chars = path.chars().peekable();
    let mut field = String::new();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !field.is_empty() {
                    steps.push(Step::Field(std::mem::take(&mut field)));
                }
            }
            '[' => {
                if !field.is_empty() {
                    steps.push(Step::Field(std::mem::take(&mut field)));
                }
                let mut inner = String::new();
                loop {
                    match chars.next()? {
                        ']' => break,
                        other => inner.push(other),
                    }
                }
                let quoted = inner
                    .strip_prefix('\'')
                    .and_then(|s| s.strip_suffix('\''))
                    .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
                match quoted {
                    Some(name) => steps.push(Step::Field(name.to_string())),
                    None => steps.push(Step::Index(inner.trim().parse().ok()?)),
                }
            }
            other => field.push(other),
        }
    }
    if !field.is_empty() {
        steps.push(Step::Field(field));
    }
    Some(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_root_path() {
        let doc = json!({"a": 1});
        assert_eq!(resolve(&doc, "$"), Some(&doc));
    }

    #[test]
    fn test_nested_fields_and_indexes() {
        let doc = json!({"action": "send", "items": [{"id": 7}], "a b": true});
        assert_eq!(resolve(&doc, "$.action"), Some(&json!("send")));
        assert_eq!(resolve(&doc, "$.items[0].id"), Some(&json!(7)));
        assert_eq!(resolve(&doc, "items[0]['id']"), Some(&json!(7)));
        assert_eq!(resolve(&doc, "$['a b']"), Some(&json!(true)));
    }

    #[test]
    fn test_missing_steps() {
        let doc = json!({"action": "send"});
        assert_eq!(resolve(&doc, "$.missing"), None);
        assert_eq!(resolve(&doc, "$.action.deeper"), None);
        assert_eq!(resolve(&doc, "$.items[x]"), None);
    }
}
