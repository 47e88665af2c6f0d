//! Content "blueprinting": rendering through the template engine with the
//! cached argument map as the value namespace.

use minijinja::{Environment, UndefinedBehavior};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

/// Render `content` with `values`.
///
/// An empty value set is an error unless `allow_empty` is set, in which
/// case the content renders against an empty namespace. Undefined
/// variables always fail the render.
pub fn render(
    content: &str,
    values: &Map<String, Value>,
    allow_empty: bool,
) -> Result<String, String> {
    if values.is_empty() && !allow_empty {
        return Err("No arguments were defined for blueprinting".to_string());
    }

    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);

    env.render_str(content, Value::Object(values.clone()))
        .map_err(|e| e.to_string())
}

/// Blueprint a file in place.
pub fn render_file(path: &Path, values: &Map<String, Value>) -> Result<(), String> {
    let content = fs::read_to_string(path).map_err(|e| e.to_string())?;
    let rendered = render(&content, values, false)?;
    fs::write(path, rendered).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values() -> Map<String, Value> {
        let Value::Object(map) = json!({"name": "fabric", "port": 5555}) else {
            unreachable!()
        };
        map
    }

    #[test]
    fn test_render_interpolates() {
        let out = render("echo {{ name }}:{{ port }}", &values(), false).unwrap();
        assert_eq!(out, "echo fabric:5555");
    }

    #[test]
    fn test_undefined_variable_fails() {
        assert!(render("echo {{ missing }}", &values(), false).is_err());
    }

    #[test]
    fn test_empty_values_rejected_unless_allowed() {
        let empty = Map::new();
        assert!(render("echo hi", &empty, false).is_err());
        assert_eq!(render("echo hi", &empty, true).unwrap(), "echo hi");
    }

    #[test]
    fn test_trailing_newline_preserved() {
        let out = render("{{ name }}\n", &values(), false).unwrap();
        assert_eq!(out, "fabric\n");
    }

    #[test]
    fn test_render_file_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf");
        fs::write(&path, "listen {{ port }}").unwrap();
        render_file(&path, &values()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "listen 5555");
    }
}
