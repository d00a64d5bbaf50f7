use std::path::Path;

/// Post-merge build command inferred from the repository's tooling.
pub fn discover_build_command(repo_path: &Path) -> Option<String> {
    if file_exists(repo_path, "Justfile") || file_exists(repo_path, "justfile") {
        return Some("just build".to_string());
    }
    if file_exists(repo_path, "Cargo.toml") {
        return Some("cargo build --workspace --all-targets".to_string());
    }
    if file_exists(repo_path, "package.json") {
        return Some("npm run build --if-present".to_string());
    }
    if file_exists(repo_path, "pyproject.toml") {
        return Some("python -m compileall -q .".to_string());
    }
    None
}

/// A configured command wins over discovery. An explicitly empty command
/// disables the build step.
pub fn resolve_build_command(repo_path: &Path, configured: Option<&str>) -> Option<String> {
    match configured {
        Some(command) if command.trim().is_empty() => None,
        Some(command) => Some(command.to_string()),
        None => discover_build_command(repo_path),
    }
}

fn file_exists(repo_path: &Path, name: &str) -> bool {
    repo_path.join(name).exists()
}
