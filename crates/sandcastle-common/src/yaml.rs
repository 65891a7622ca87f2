//! YAML helpers for machine configs, patches and credential files
//!
//! Documents are parsed with yaml-rust2 into `serde_json::Value` so the rest
//! of the workspace manipulates a single structured representation (JSON
//! pointers, JSON patches). Rendering back to YAML goes through serde_yaml.

use serde::Serialize;
use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

use crate::Error;

/// Error produced while converting YAML text
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct YamlError(String);

impl From<YamlError> for Error {
    fn from(e: YamlError) -> Self {
        Error::serialization(e.0)
    }
}

/// Parse a single YAML (or JSON) document into a `serde_json::Value`.
///
/// Empty input yields `Value::Null`. More than one document is rejected:
/// configs and credentials are always single documents, and silently
/// dropping the tail would hide a malformed file.
pub fn parse_yaml(input: &str) -> Result<Value, YamlError> {
    let mut docs = YamlLoader::load_from_str(input).map_err(|e| YamlError(e.to_string()))?;
    match docs.len() {
        0 => Ok(Value::Null),
        1 => yaml_to_json(docs.remove(0)),
        n => Err(YamlError(format!("expected a single document, found {}", n))),
    }
}

/// Render any serializable value as YAML text
pub fn to_yaml<T: Serialize>(value: &T) -> Result<String, YamlError> {
    serde_yaml::to_string(value).map_err(|e| YamlError(e.to_string()))
}

fn yaml_to_json(yaml: Yaml) -> Result<Value, YamlError> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|e: std::num::ParseFloatError| YamlError(e.to_string()))?;
            Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| YamlError(format!("non-finite number '{}'", s)))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(items) => items
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| Ok((yaml_key(k)?, yaml_to_json(v)?)))
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(YamlError("YAML aliases are not supported".to_string())),
        Yaml::BadValue => Err(YamlError("bad YAML value".to_string())),
    }
}

fn yaml_key(key: Yaml) -> Result<String, YamlError> {
    match key {
        Yaml::String(s) | Yaml::Real(s) => Ok(s),
        Yaml::Integer(i) => Ok(i.to_string()),
        Yaml::Boolean(b) => Ok(b.to_string()),
        Yaml::Null => Ok("null".to_string()),
        other => Err(YamlError(format!("unsupported mapping key {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_mapping() {
        let value = parse_yaml(
            r#"
machine:
  type: controlplane
  network:
    hostname: t1-controlplane-1
  certSANs: [localhost, 10.87.13.37]
debug: false
"#,
        )
        .unwrap();

        assert_eq!(value["machine"]["type"], "controlplane");
        assert_eq!(value["machine"]["network"]["hostname"], "t1-controlplane-1");
        assert_eq!(value["machine"]["certSANs"][1], "10.87.13.37");
        assert_eq!(value["debug"], false);
    }

    #[test]
    fn json_is_valid_yaml() {
        let value = parse_yaml(r#"[{"op": "add", "path": "/a", "value": 1}]"#).unwrap();
        assert_eq!(value[0]["op"], "add");
        assert_eq!(value[0]["value"], 1);
    }

    #[test]
    fn empty_input_is_null() {
        assert_eq!(parse_yaml("").unwrap(), Value::Null);
    }

    #[test]
    fn multiple_documents_are_rejected() {
        let err = parse_yaml("a: 1\n---\nb: 2\n").unwrap_err();
        assert!(err.to_string().contains("single document"));
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        assert!(parse_yaml("key: [unterminated").is_err());
    }

    #[test]
    fn renders_back_to_yaml() {
        let value = serde_json::json!({"cluster": {"clusterName": "t1"}});
        let text = to_yaml(&value).unwrap();
        assert!(text.contains("clusterName: t1"));
        assert_eq!(parse_yaml(&text).unwrap(), value);
    }
}
