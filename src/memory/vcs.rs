use std::path::{Path, PathBuf};

const STATE_MARKERS: &[&str] = &[".git", ".conductor-kit"];

/// Project identity a memory snapshot is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsContext {
    pub project_root: PathBuf,
    pub head: Option<String>,
}

impl VcsContext {
    pub fn detect(cwd: &Path) -> Self {
        let project_root = resolve_project_root(cwd);
        let head = resolve_head(&project_root);
        Self { project_root, head }
    }

    pub fn root_key(&self) -> String {
        self.project_root.to_string_lossy().to_string()
    }
}

/// Nearest ancestor of `start` holding a VCS or local-state marker, else
/// `start` itself.
pub fn resolve_project_root(start: &Path) -> PathBuf {
    start
        .ancestors()
        .find(|dir| STATE_MARKERS.iter().any(|marker| dir.join(marker).exists()))
        .unwrap_or(start)
        .to_path_buf()
}

/// `.git` is either the directory itself or a file with a `gitdir:` pointer
/// (worktrees, submodules).
pub fn resolve_git_dir(root: &Path) -> Option<PathBuf> {
    let git_path = root.join(".git");
    let metadata = std::fs::metadata(&git_path).ok()?;
    if metadata.is_dir() {
        return Some(git_path);
    }
    let raw = std::fs::read_to_string(&git_path).ok()?;
    let pointer = raw.trim().strip_prefix("gitdir:")?.trim();
    if pointer.is_empty() {
        return None;
    }
    let pointer = Path::new(pointer);
    if pointer.is_absolute() {
        Some(pointer.to_path_buf())
    } else {
        Some(root.join(pointer))
    }
}

pub fn resolve_head(root: &Path) -> Option<String> {
    let git_dir = resolve_git_dir(root)?;
    let raw = std::fs::read_to_string(git_dir.join("HEAD")).ok()?;
    let head = raw.trim();
    match head.strip_prefix("ref:") {
        Some(reference) => resolve_ref(&git_dir, reference.trim()),
        None if head.is_empty() => None,
        None => Some(head.to_string()),
    }
}

fn resolve_ref(git_dir: &Path, reference: &str) -> Option<String> {
    if reference.is_empty() {
        return None;
    }
    let loose = reference
        .split('/')
        .fold(git_dir.to_path_buf(), |path, part| path.join(part));
    if let Ok(raw) = std::fs::read_to_string(loose) {
        let value = raw.trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }

    let packed = std::fs::read_to_string(git_dir.join("packed-refs")).ok()?;
    packed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('^'))
        .find_map(|line| {
            let mut parts = line.split_whitespace();
            let hash = parts.next()?;
            (parts.next()? == reference).then(|| hash.to_string())
        })
}
