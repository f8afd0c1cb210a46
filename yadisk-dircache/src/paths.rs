//! Canonical remote path handling.
//!
//! Remote paths are POSIX-like (`/Docs/A.txt`). The API sometimes prefixes
//! them with `disk:`; canonical paths never carry it.

const DISK_SCHEME: &str = "disk:";

/// Canonical form: single leading slash, no empty or `.` segments, no
/// trailing slash except for `/` itself. Returns `None` for empty input or
/// a `..` segment.
pub fn normalize(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let raw = raw.strip_prefix(DISK_SCHEME).unwrap_or(raw);
    if raw.is_empty() {
        return None;
    }

    let mut out = String::with_capacity(raw.len() + 1);
    for segment in raw.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            part => {
                out.push('/');
                out.push_str(part);
            }
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Some(out)
}

/// Parent of a canonical path; `/` has none.
pub fn parent(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rsplit_once('/') {
        Some(("", _)) => Some("/".to_string()),
        Some((dir, _)) => Some(dir.to_string()),
        None => None,
    }
}

/// Last segment of a canonical path (`/` for the root).
pub fn file_name(path: &str) -> &str {
    if path == "/" {
        return path;
    }
    path.rsplit('/').next().unwrap_or(path)
}

/// Segment-aware containment: `/a/b` is within `/a`, `/ab` is not.
pub fn is_within(path: &str, root: &str) -> bool {
    if root == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(root) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// Appends `rest` (canonical, `/`-prefixed or empty) to `base`.
pub fn join(base: &str, rest: &str) -> String {
    if rest.is_empty() || rest == "/" {
        return base.to_string();
    }
    if base == "/" {
        return rest.to_string();
    }
    format!("{base}{rest}")
}

/// The path itself followed by each ancestor up to and including `/`.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let mut next = Some(path);
    std::iter::from_fn(move || {
        let current = next?;
        next = if current == "/" {
            None
        } else {
            match current.rfind('/') {
                Some(0) => Some("/"),
                Some(idx) => Some(&current[..idx]),
                None => None,
            }
        };
        Some(current)
    })
}
