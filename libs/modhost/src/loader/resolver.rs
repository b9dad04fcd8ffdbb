use std::path::{Path, PathBuf};

/// Maps dependency names to files next to a module's origin.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    base_dir: PathBuf,
    extension: String,
}

impl DependencyResolver {
    pub fn for_origin(origin: &Path, extension: &str) -> Self {
        Self {
            base_dir: origin.parent().map(Path::to_path_buf).unwrap_or_default(),
            extension: extension.trim_start_matches('.').to_owned(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base>/<name>.<ext>` if that file exists.
    pub fn resolve_to_path(&self, name: &str) -> Option<PathBuf> {
        if !is_plain_name(name) {
            return None;
        }
        let candidate = self.base_dir.join(format!("{name}.{}", self.extension));
        candidate.is_file().then_some(candidate)
    }

    /// Platform library file for `library` in the base directory, if present.
    pub fn resolve_native_to_path(&self, library: &str) -> Option<PathBuf> {
        if !is_plain_name(library) {
            return None;
        }
        let candidate = self.base_dir.join(libloading::library_filename(library));
        candidate.is_file().then_some(candidate)
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}
