//! Workspace identity by filesystem path.
//!
//! Both pairing directions go through [`related`], so a requester and a
//! responder agree on "same project" no matter which side proposes.

use std::path::{Component, Path, PathBuf};

const CASE_INSENSITIVE_FS: bool = cfg!(any(windows, target_os = "macos"));

/// Normalize a workspace path into the string form used as a pairing key.
///
/// The result is absolute, uses `/` separators, has symlinks resolved for the
/// longest existing prefix, is lower-cased on case-insensitive filesystems and
/// carries no trailing separator. Paths that do not exist are still
/// normalized lexically.
pub fn normalize_workspace_path(raw: &str) -> String {
    let trimmed = raw.trim();
    let path = Path::new(trimmed);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };
    let resolved = resolve_existing_prefix(&lexical_clean(&absolute));

    let mut text = resolved.to_string_lossy().replace('\\', "/");
    if let Some(rest) = text.strip_prefix("//?/") {
        text = rest.to_string();
    }
    if CASE_INSENSITIVE_FS {
        text = text.to_lowercase();
    }
    strip_trailing_separator(text)
}

/// True when two workspace paths are equal or one contains the other at a
/// directory boundary.
pub fn related(a: &str, b: &str) -> bool {
    let a = normalize_workspace_path(a);
    let b = normalize_workspace_path(b);
    a == b || is_ancestor(&a, &b) || is_ancestor(&b, &a)
}

/// The workspace both sides settle on when `a` and `b` are related: the
/// ancestor of the two.
pub fn shared_workspace(a: &str, b: &str) -> Option<String> {
    let a = normalize_workspace_path(a);
    let b = normalize_workspace_path(b);
    if a == b || is_ancestor(&a, &b) {
        Some(a)
    } else if is_ancestor(&b, &a) {
        Some(b)
    } else {
        None
    }
}

/// Answer to a `workspace-sync-request` as computed by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncDecision {
    pub accepted: bool,
    pub final_workspace: Option<String>,
}

pub fn decide_sync(own_workspace: &str, candidate_workspace: &str) -> SyncDecision {
    let final_workspace = shared_workspace(own_workspace, candidate_workspace);
    tracing::debug!(
        target = "ask_broker::workspace",
        own = %own_workspace,
        candidate = %candidate_workspace,
        accepted = final_workspace.is_some(),
        "evaluated workspace sync proposal"
    );
    SyncDecision {
        accepted: final_workspace.is_some(),
        final_workspace,
    }
}

fn is_ancestor(parent: &str, child: &str) -> bool {
    if parent.len() >= child.len() || !child.starts_with(parent) {
        return false;
    }
    parent.ends_with('/') || child.as_bytes()[parent.len()] == b'/'
}

fn lexical_clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => cleaned.push(prefix.as_os_str()),
            Component::RootDir => cleaned.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                let at_root = matches!(
                    cleaned.components().next_back(),
                    None | Some(Component::RootDir) | Some(Component::Prefix(_))
                );
                if !at_root {
                    cleaned.pop();
                }
            }
            Component::Normal(part) => cleaned.push(part),
        }
    }
    cleaned
}

fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut missing = Vec::new();
    loop {
        if let Ok(canonical) = std::fs::canonicalize(existing) {
            let mut resolved = canonical;
            for part in missing.iter().rev() {
                resolved.push(part);
            }
            return resolved;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

fn strip_trailing_separator(mut text: String) -> String {
    let is_root = text == "/" || (text.len() == 3 && text.ends_with(":/"));
    if !is_root && text.ends_with('/') {
        text.pop();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::{decide_sync, normalize_workspace_path, related, shared_workspace};

    #[test]
    fn child_directory_is_related() {
        assert!(related("/a/b", "/a/b/c"));
        assert!(related("/a/b/c", "/a/b"));
    }

    #[test]
    fn prefix_without_boundary_is_not_related() {
        assert!(!related("/a/b", "/a/bc"));
        assert!(!related("/a/bc", "/a/b"));
    }

    #[test]
    fn siblings_are_not_related() {
        assert!(!related("/work/alpha", "/work/beta"));
    }

    #[test]
    fn trailing_separator_and_dots_are_ignored() {
        assert_eq!(
            normalize_workspace_path("/nonexistent-ws/x/"),
            normalize_workspace_path("/nonexistent-ws/./y/../x")
        );
        assert!(related("/nonexistent-ws/x/", "/nonexistent-ws/x"));
    }

    #[test]
    fn root_keeps_its_separator() {
        assert_eq!(normalize_workspace_path("/"), "/");
        assert_eq!(normalize_workspace_path("/.."), "/");
    }

    #[test]
    fn relative_paths_become_absolute() {
        let normalized = normalize_workspace_path("some-relative-dir");
        assert!(normalized.starts_with('/') || normalized.contains(":/"));
        assert!(normalized.ends_with("some-relative-dir"));
    }

    #[test]
    fn normalization_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let existing = tmp.path().join("proj");
        std::fs::create_dir_all(&existing).unwrap();
        let samples = [
            "/a/b".to_string(),
            "/a/b/".to_string(),
            "/a/./b/../b/c".to_string(),
            "relative/path".to_string(),
            existing.display().to_string(),
            format!("{}/", existing.display()),
            format!("{}/missing/child", existing.display()),
        ];
        for sample in samples {
            let once = normalize_workspace_path(&sample);
            assert_eq!(normalize_workspace_path(&once), once, "sample {sample}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_resolve_to_their_target() {
        let tmp = tempfile::tempdir().unwrap();
        let real = tmp.path().join("real");
        std::fs::create_dir_all(real.join("sub")).unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        assert_eq!(
            normalize_workspace_path(&link.display().to_string()),
            normalize_workspace_path(&real.display().to_string())
        );
        assert!(related(
            &link.display().to_string(),
            &real.join("sub").display().to_string()
        ));
        // a missing child under a symlinked parent still resolves the parent
        assert_eq!(
            normalize_workspace_path(&link.join("not-yet").display().to_string()),
            format!(
                "{}/not-yet",
                normalize_workspace_path(&real.display().to_string())
            )
        );
    }

    #[test]
    fn shared_workspace_is_the_ancestor() {
        assert_eq!(
            shared_workspace("/ws-root/app/src", "/ws-root/app"),
            Some("/ws-root/app".to_string())
        );
        assert_eq!(
            shared_workspace("/ws-root/app", "/ws-root/app"),
            Some("/ws-root/app".to_string())
        );
        assert_eq!(shared_workspace("/ws-root/app", "/ws-root/lib"), None);
    }

    #[test]
    fn sync_decision_carries_final_workspace() {
        let accepted = decide_sync("/proj-x", "/proj-x/tools");
        assert!(accepted.accepted);
        assert_eq!(accepted.final_workspace.as_deref(), Some("/proj-x"));

        let rejected = decide_sync("/proj-x", "/proj-y");
        assert!(!rejected.accepted);
        assert!(rejected.final_workspace.is_none());
    }
}
