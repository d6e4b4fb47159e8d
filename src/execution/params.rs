/// Call-site parameters: validation against the manifest's declared
/// arguments and rendering as `--name=value` command-line flags.
use serde_json::{Map, Value};

use crate::error::ValidationIssue;
use crate::manifest::ArgumentSpec;

/// Checks `params` against `arguments`: every required argument present,
/// no undeclared keys, and declared types respected. Unknown type names
/// accept any value. Returns every problem found.
pub fn validate_params(
    arguments: &[ArgumentSpec],
    params: &Map<String, Value>,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    for arg in arguments.iter().filter(|a| a.required) {
        if !params.contains_key(&arg.name) {
            issues.push(ValidationIssue::new(&arg.name, "required parameter is missing"));
        }
    }

    for (name, value) in params {
        let Some(arg) = arguments.iter().find(|a| &a.name == name) else {
            issues.push(ValidationIssue::new(name, "parameter is not declared by the script"));
            continue;
        };
        if !type_matches(&arg.arg_type, value) {
            issues.push(ValidationIssue::new(
                name,
                format!("expected {}, got {}", arg.arg_type, json_type(value)),
            ));
        }
    }

    issues
}

fn type_matches(declared: &str, value: &Value) -> bool {
    match declared {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Renders params as `--name=value`, in declaration order. Strings are
/// passed raw, everything else JSON-encoded.
pub fn format_args(arguments: &[ArgumentSpec], params: &Map<String, Value>) -> Vec<String> {
    arguments
        .iter()
        .filter_map(|arg| {
            params.get(&arg.name).map(|value| match value {
                Value::String(s) => format!("--{}={s}", arg.name),
                other => format!("--{}={other}", arg.name),
            })
        })
        .collect()
}

/// Parses `name=value` pairs from the command line into params, typed by
/// the declared argument (a non-string value that fails to parse as JSON
/// is kept as a string, and will then fail type validation).
pub fn parse_cli_params(
    arguments: &[ArgumentSpec],
    pairs: &[String],
) -> Result<Map<String, Value>, ValidationIssue> {
    let mut params = Map::new();
    for pair in pairs {
        let Some((name, raw)) = pair.split_once('=') else {
            return Err(ValidationIssue::new(pair, "expected name=value"));
        };
        let declared = arguments.iter().find(|a| a.name == name).map(|a| a.arg_type.as_str());
        let value = match declared {
            Some("string") | None => Value::String(raw.to_string()),
            Some(_) => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
        };
        params.insert(name.to_string(), value);
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args() -> Vec<ArgumentSpec> {
        let spec = |name: &str, ty: &str, required: bool| ArgumentSpec {
            name: name.into(),
            arg_type: ty.into(),
            description: format!("{name} argument"),
            required,
        };
        vec![
            spec("input", "string", true),
            spec("limit", "number", false),
            spec("verbose", "boolean", false),
            spec("fields", "array", false),
            spec("mode", "enum", false),
        ]
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_valid_params_pass() {
        let p = params(json!({
            "input": "a.txt",
            "limit": 5,
            "verbose": true,
            "fields": ["x"],
            "mode": 3
        }));
        assert!(validate_params(&args(), &p).is_empty());
    }

    #[test]
    fn test_all_problems_reported_together() {
        let p = params(json!({"limit": "five", "extra": 1, "verbose": "yes"}));
        let issues = validate_params(&args(), &p);
        let fields: Vec<&str> = issues.iter().map(|i| i.field.as_str()).collect();
        assert_eq!(fields, vec!["input", "extra", "limit", "verbose"]);
        assert!(issues[2].message.contains("expected number, got string"));
    }

    #[test]
    fn test_custom_type_accepts_anything() {
        for value in [json!(null), json!({"a": 1}), json!("x")] {
            let mut p = params(json!({"input": "a"}));
            p.insert("mode".into(), value);
            assert!(validate_params(&args(), &p).is_empty());
        }
    }

    #[test]
    fn test_format_args_in_declaration_order() {
        let p = params(json!({
            "verbose": false,
            "fields": ["a", "b"],
            "input": "my file.txt",
            "limit": 2.5
        }));
        assert_eq!(
            format_args(&args(), &p),
            vec![
                "--input=my file.txt",
                "--limit=2.5",
                "--verbose=false",
                "--fields=[\"a\",\"b\"]",
            ]
        );
    }

    #[test]
    fn test_parse_cli_params_types_by_declaration() {
        let pairs: Vec<String> =
            ["input=42", "limit=42", "verbose=true", "fields=[1,2]", "limit2=x"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let p = parse_cli_params(&args(), &pairs).unwrap();
        assert_eq!(p["input"], json!("42"));
        assert_eq!(p["limit"], json!(42));
        assert_eq!(p["verbose"], json!(true));
        assert_eq!(p["fields"], json!([1, 2]));
        assert_eq!(p["limit2"], json!("x"));

        assert!(parse_cli_params(&args(), &["novalue".to_string()]).is_err());
    }
}
