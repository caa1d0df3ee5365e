//! Minimal HCL rendering for generated terraform files

use serde_json::Value;

/// Render a JSON value as an HCL expression.
///
/// Strings keep `${...}` interpolations intact so remote-state expressions
/// stay live in the generated code.
pub fn expr(value: &Value, indent: usize) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        Value::Array(items) => {
            if items.is_empty() {
                return "[]".to_string();
            }
            let pad = "  ".repeat(indent + 1);
            let body: Vec<String> = items
                .iter()
                .map(|item| format!("{pad}{},", expr(item, indent + 1)))
                .collect();
            format!("[\n{}\n{}]", body.join("\n"), "  ".repeat(indent))
        }
        Value::Object(map) => {
            if map.is_empty() {
                return "{}".to_string();
            }
            let pad = "  ".repeat(indent + 1);
            let body: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{pad}{} = {}", key(k), expr(v, indent + 1)))
                .collect();
            format!("{{\n{}\n{}}}", body.join("\n"), "  ".repeat(indent))
        }
    }
}

/// `name = value` attribute line at the given indent
pub fn attribute(name: &str, value: &Value, indent: usize) -> String {
    format!("{}{} = {}\n", "  ".repeat(indent), key(name), expr(value, indent))
}

fn key(k: &str) -> String {
    let is_ident = k
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && k.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if is_ident { k.to_string() } else { quote(k) }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalars() {
        assert_eq!(expr(&json!(null), 0), "null");
        assert_eq!(expr(&json!(3), 0), "3");
        assert_eq!(expr(&json!("a\"b"), 0), "\"a\\\"b\"");
    }

    #[test]
    fn test_interpolation_preserved() {
        let v = json!("${data.terraform_remote_state.net-vpc.outputs.id}");
        assert_eq!(expr(&v, 0), "\"${data.terraform_remote_state.net-vpc.outputs.id}\"");
    }

    #[test]
    fn test_nested() {
        let v = json!({ "tags": { "Name": "vpc", "my key": 1 }, "azs": ["a", "b"] });
        let out = attribute("inputs", &v, 1);
        assert_eq!(
            out,
            "  inputs = {\n    tags = {\n      Name = \"vpc\"\n      \"my key\" = 1\n    }\n    azs = [\n      \"a\",\n      \"b\",\n    ]\n  }\n"
        );
    }
}
