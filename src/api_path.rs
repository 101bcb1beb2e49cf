//! Canonical api-path handling.
//!
//! An api path is the slash-rooted identity of an object inside the mount
//! namespace: `"/"` is the root directory, separators are single forward
//! slashes, and there is no trailing slash except on the root itself.
//! Equality is byte-exact after canonicalization, so every boundary that
//! accepts a path from the mount layer or a provider runs it through
//! [`create_api_path`] first.

/// Build the canonical form of an api path from arbitrary input.
///
/// Backslashes are treated as separators (Windows shims hand them in),
/// repeated separators collapse, `.` segments drop, and the result is
/// always rooted.
pub fn create_api_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for part in path.split(['/', '\\']) {
        if part.is_empty() || part == "." {
            continue;
        }
        out.push('/');
        out.push_str(part);
    }

    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Derive the parent api path. The root is its own parent.
pub fn get_parent_api_path(api_path: &str) -> String {
    match api_path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(idx) => api_path[..idx].to_owned(),
    }
}

/// Final path segment, or `""` for the root.
pub fn file_name(api_path: &str) -> &str {
    api_path.rsplit('/').next().unwrap_or("")
}
