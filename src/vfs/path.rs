//! Path handling
//!
//! All VFS paths are absolute. Parsing splits on `/`, dropping empty and
//! `.` segments and applying `..` as a pop that never underflows the root.

/// Split a path into normalized components. `..` pops, `.` and empty
/// segments vanish. The result never escapes the root.
pub fn components(path: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            name => out.push(name.to_string()),
        }
    }
    out
}

/// Normalize a path to its canonical absolute form.
pub fn normalize(path: &str) -> String {
    join(&components(path))
}

/// Join components back into an absolute path.
pub fn join(parts: &[String]) -> String {
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Parent path of a normalized path (`None` for the root).
pub fn parent(path: &str) -> Option<String> {
    let mut parts = components(path);
    if parts.is_empty() {
        return None;
    }
    parts.pop();
    Some(join(&parts))
}

/// Final component of a path (`None` for the root).
pub fn file_name(path: &str) -> Option<String> {
    components(path).pop()
}

/// Whether `path` equals `prefix` or lies strictly underneath it.
pub fn starts_with(path: &str, prefix: &str) -> bool {
    let path = normalize(path);
    let prefix = normalize(prefix);
    if prefix == "/" {
        return true;
    }
    path == prefix || path.starts_with(&format!("{}/", prefix))
}

/// Resolve `target` relative to the directory holding `link_parts`.
///
/// Absolute targets restart from the root; relative targets extend the
/// link's parent directory.
pub fn resolve_link_target(link_parts: &[String], target: &str) -> Vec<String> {
    if target.starts_with('/') {
        components(target)
    } else {
        let mut base: Vec<String> = link_parts.to_vec();
        base.pop(); // drop the link name itself
        for segment in target.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    base.pop();
                }
                name => base.push(name.to_string()),
            }
        }
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_components_basic() {
        assert_eq!(components("/home/user"), vec!["home", "user"]);
        assert_eq!(components("/home//user/"), vec!["home", "user"]);
        assert_eq!(components("/home/./user"), vec!["home", "user"]);
    }

    #[test]
    fn test_dotdot_pops() {
        assert_eq!(components("/home/user/../other"), vec!["home", "other"]);
    }

    #[test]
    fn test_dotdot_never_underflows_root() {
        assert_eq!(components("/../../etc"), vec!["etc"]);
        assert!(components("/..").is_empty());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/home//user/./x/.."), "/home/user");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("//"), "/");
    }

    #[test]
    fn test_parent() {
        assert_eq!(parent("/home/user"), Some("/home".to_string()));
        assert_eq!(parent("/home"), Some("/".to_string()));
        assert_eq!(parent("/"), None);
    }

    #[test]
    fn test_starts_with() {
        assert!(starts_with("/home/user/a.txt", "/home"));
        assert!(starts_with("/home", "/home"));
        assert!(!starts_with("/homework", "/home"));
        assert!(starts_with("/anything", "/"));
    }

    #[test]
    fn test_resolve_link_target_relative() {
        let link = vec!["home".to_string(), "user".to_string(), "l".to_string()];
        assert_eq!(
            resolve_link_target(&link, "../other/x"),
            vec!["home", "other", "x"]
        );
    }

    #[test]
    fn test_resolve_link_target_absolute() {
        let link = vec!["home".to_string(), "l".to_string()];
        assert_eq!(resolve_link_target(&link, "/tmp/x"), vec!["tmp", "x"]);
    }
}
