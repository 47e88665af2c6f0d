//! Ownership and mode helpers shared by the file-flavored verbs.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Resolve a user name or numeric id to a uid.
pub fn resolve_uid(user: &str) -> Result<u32, String> {
    if let Ok(uid) = user.parse::<u32>() {
        return Ok(uid);
    }
    lookup_id("/etc/passwd", user)
        .ok_or_else(|| format!("Failed to set ownership properties. USER:{user}"))
}

/// Resolve a group name or numeric id to a gid.
pub fn resolve_gid(group: &str) -> Result<u32, String> {
    if let Ok(gid) = group.parse::<u32>() {
        return Ok(gid);
    }
    lookup_id("/etc/group", group)
        .ok_or_else(|| format!("Failed to set ownership properties. GROUP:{group}"))
}

/// Apply ownership to a path. A missing group leaves the gid untouched.
pub fn apply_ownership(
    path: &Path,
    user: Option<&str>,
    group: Option<&str>,
) -> Result<(), String> {
    let Some(user) = user else {
        return Ok(());
    };
    let uid = resolve_uid(user)?;
    let gid = match group {
        Some(group) => Some(resolve_gid(group)?),
        None => None,
    };
    std::os::unix::fs::chown(path, Some(uid), gid).map_err(|e| e.to_string())
}

pub fn apply_mode(path: &Path, mode: u32) -> Result<(), String> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| e.to_string())
}

/// Walk a directory applying ownership and mode to every entry.
pub fn apply_recursive(
    path: &Path,
    user: Option<&str>,
    group: Option<&str>,
    mode: Option<u32>,
) -> Result<(), String> {
    apply_ownership(path, user, group)?;
    if let Some(mode) = mode {
        apply_mode(path, mode)?;
    }
    if path.is_dir() {
        for entry in fs::read_dir(path).map_err(|e| e.to_string())? {
            let entry = entry.map_err(|e| e.to_string())?;
            apply_recursive(&entry.path(), user, group, mode)?;
        }
    }
    Ok(())
}

/// `name:id` lines in passwd/group format: fields split on `:` with the
/// numeric id third.
fn lookup_id(db: &str, name: &str) -> Option<u32> {
    let content = fs::read_to_string(db).ok()?;
    for line in content.lines() {
        let mut fields = line.split(':');
        if fields.next() == Some(name) {
            return fields.nth(1).and_then(|id| id.parse().ok());
        }
    }
    None
}

/// Parse an octal mode string such as `0644`.
pub fn parse_mode(mode: &str) -> Result<u32, String> {
    u32::from_str_radix(mode.trim_start_matches("0o"), 8)
        .map_err(|_| format!("Invalid mode: '{mode}'"))
}

/// Split a `user[:group]` ownership spec.
pub fn parse_chown(spec: &str) -> (String, Option<String>) {
    match spec.split_once(':') {
        Some((user, group)) => (user.to_string(), Some(group.to_string())),
        None => (spec.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_ids_resolve_directly() {
        assert_eq!(resolve_uid("1042").unwrap(), 1042);
        assert_eq!(resolve_gid("0").unwrap(), 0);
    }

    #[test]
    fn test_unknown_name_is_an_error() {
        let err = resolve_uid("no-such-user-here").unwrap_err();
        assert!(err.contains("Failed to set ownership properties"));
    }

    #[test]
    fn test_parse_mode_octal() {
        assert_eq!(parse_mode("0644").unwrap(), 0o644);
        assert_eq!(parse_mode("755").unwrap(), 0o755);
        assert!(parse_mode("9z9").is_err());
    }

    #[test]
    fn test_parse_chown_forms() {
        assert_eq!(
            parse_chown("svc:web"),
            ("svc".to_string(), Some("web".to_string()))
        );
        assert_eq!(parse_chown("svc"), ("svc".to_string(), None));
    }
}
