//! The CVS repository on disk and the SVN directory layout it maps onto.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context as _;
use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;
use walkdir::WalkDir;

use crate::model::SymbolType;

lazy_static! {
    /// Characters that cannot appear in an SVN path component.
    static ref UNSAFE_SYMBOL_CHARS: Regex = Regex::new(r#"[/\\ \t\n\r:*?"<>|]"#).unwrap();
}

/// The trunk/branches/tags layout of the target repository.
#[derive(Debug, Clone)]
pub struct Layout {
    pub trunk: String,
    pub branches: String,
    pub tags: String,
    pub trunk_only: bool,
}

impl Layout {
    pub fn new(trunk: &str, branches: &str, tags: &str, trunk_only: bool) -> Result<Self> {
        let trunk = normalize_svn_path(trunk)?;
        let branches = normalize_svn_path(branches)?;
        let tags = normalize_svn_path(tags)?;
        if !trunk_only {
            for (a, b) in [(&trunk, &branches), (&trunk, &tags), (&branches, &tags)] {
                if a == b || is_path_prefix(a, b) || is_path_prefix(b, a) {
                    bail!("--trunk, --branches and --tags paths must be disjoint ({} vs {})", a, b);
                }
            }
        }
        Ok(Self { trunk, branches, tags, trunk_only })
    }

    /// The base directory for symbols of the given type.
    pub fn symbol_base(&self, symbol_type: SymbolType) -> &str {
        match symbol_type {
            SymbolType::Branch => &self.branches,
            SymbolType::Tag => &self.tags,
            SymbolType::Excluded => panic!("excluded symbols have no path"),
        }
    }
}

fn normalize_svn_path(path: &str) -> Result<String> {
    let path = path.trim_matches('/');
    if path.is_empty() {
        bail!("project layout paths may not be empty");
    }
    for component in path.split('/') {
        verify_component(component)?;
    }
    Ok(path.to_string())
}

fn is_path_prefix(prefix: &str, path: &str) -> bool {
    path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/')
}

fn verify_component(component: &str) -> Result<()> {
    if component.is_empty() || component == "." || component == ".." {
        bail!("illegal path component: {:?}", component);
    }
    if component.bytes().any(|b| b < 0x20 || b == 0x7f) {
        bail!("control character in path component: {:?}", component);
    }
    Ok(())
}

/// A discovered RCS file, not yet assigned an id.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    pub rcs_path: PathBuf,
    /// Project-relative SVN path, `Attic/` stripped and `,v` removed.
    pub svn_path: String,
    pub executable: bool,
    pub size: u64,
    pub in_attic: bool,
}

/// The CVS repository being converted.
#[derive(Debug)]
pub struct Project {
    /// Ancestor directory containing `CVSROOT`.
    pub cvs_root: PathBuf,
    /// The directory the conversion was pointed at.
    pub project_root: PathBuf,
}

impl Project {
    /// Locate the repository by walking upward until a `CVSROOT` sibling is
    /// found.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let project_root = path
            .as_ref()
            .canonicalize()
            .with_context(|| format!("invalid CVS path: {}", path.as_ref().display()))?;
        if !project_root.is_dir() {
            bail!("not a directory: {}", project_root.display());
        }

        let mut candidate = project_root.clone();
        loop {
            if candidate.join("CVSROOT").is_dir() {
                log::info!("CVS repository root: {}", candidate.display());
                return Ok(Self { cvs_root: candidate, project_root });
            }
            match candidate.parent() {
                Some(parent) => candidate = parent.to_path_buf(),
                None => bail!(
                    "no CVSROOT directory found above {}; is this a CVS repository?",
                    project_root.display()
                ),
            }
        }
    }

    /// Walk the project tree collecting `*,v` files.
    ///
    /// A file present both inside and outside `Attic/` is a fatal
    /// inconsistency; so is an illegal CVS filename.
    pub fn discover_files(&self) -> Result<Vec<DiscoveredFile>> {
        let mut files = Vec::new();
        let mut by_svn_path: HashMap<String, bool> = HashMap::new();

        for entry in WalkDir::new(&self.project_root).sort_by_file_name() {
            let entry = entry?;
            if entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !name.ends_with(",v") {
                continue;
            }
            if entry.path().components().any(|c| c.as_os_str() == "CVSROOT") {
                continue;
            }

            let file = self.examine(entry.path())?;
            match by_svn_path.get(&file.svn_path) {
                Some(&other_in_attic) if other_in_attic != file.in_attic => {
                    bail!(
                        "{} exists both inside and outside the Attic",
                        file.svn_path
                    );
                }
                Some(_) => bail!("duplicate RCS file for {}", file.svn_path),
                None => {
                    by_svn_path.insert(file.svn_path.clone(), file.in_attic);
                }
            }
            files.push(file);
        }

        if files.is_empty() {
            bail!("no RCS files found under {}", self.project_root.display());
        }
        files.sort_by(|a, b| a.svn_path.cmp(&b.svn_path));
        log::info!("found {} RCS file(s)", files.len());
        Ok(files)
    }

    fn examine(&self, rcs_path: &Path) -> Result<DiscoveredFile> {
        let relative = rcs_path
            .strip_prefix(&self.project_root)
            .expect("walked file must be under the project root");

        let mut components = Vec::new();
        let mut in_attic = false;
        let n = relative.components().count();
        for (i, component) in relative.components().enumerate() {
            let text = component.as_os_str().to_string_lossy().into_owned();
            if text == "Attic" && i + 2 == n {
                in_attic = true;
                continue;
            }
            components.push(text);
        }

        let basename = components.pop().expect("file path has a basename");
        let basename = basename.strip_suffix(",v").expect("checked by caller").to_string();
        verify_component(&basename)
            .with_context(|| format!("illegal CVS filename at {}", rcs_path.display()))?;
        for component in &components {
            verify_component(component)
                .with_context(|| format!("illegal CVS directory at {}", rcs_path.display()))?;
        }
        components.push(basename);

        let meta = rcs_path.metadata()?;
        Ok(DiscoveredFile {
            rcs_path: rcs_path.to_path_buf(),
            svn_path: components.join("/"),
            executable: is_executable(&meta),
            size: meta.len(),
            in_attic,
        })
    }
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    false
}

/// Scrub a symbolic name into a usable SVN path component.
pub fn clean_symbol_name(name: &str) -> String {
    UNSAFE_SYMBOL_CHARS.replace_all(name, "_").into_owned()
}

/// A `--symbol-transform PATTERN:SUBST` rule. The pattern must match the
/// whole symbol name for the substitution to apply.
#[derive(Debug, Clone)]
pub struct SymbolTransform {
    pattern: Regex,
    replacement: String,
}

impl SymbolTransform {
    pub fn parse(rule: &str) -> Result<Self> {
        let (pattern, replacement) = rule
            .split_once(':')
            .with_context(|| format!("malformed symbol transform (want PATTERN:SUBST): {:?}", rule))?;
        let pattern = Regex::new(&format!("^(?:{})$", pattern))
            .with_context(|| format!("invalid symbol transform pattern: {:?}", pattern))?;
        Ok(Self { pattern, replacement: replacement.to_string() })
    }

    pub fn apply(&self, name: &str) -> Option<String> {
        self.pattern
            .captures(name)
            .map(|caps| {
                let mut out = String::new();
                caps.expand(&self.replacement, &mut out);
                out
            })
    }
}

/// Run a name through the transform list; the first matching rule wins.
pub fn transform_symbol_name(transforms: &[SymbolTransform], name: &str) -> String {
    for transform in transforms {
        if let Some(renamed) = transform.apply(name) {
            if renamed != name {
                log::info!("symbol {:?} transformed to {:?}", name, renamed);
            }
            return renamed;
        }
    }
    name.to_string()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn layout_rejects_overlapping_paths() {
        assert!(Layout::new("trunk", "trunk/branches", "tags", false).is_err());
        assert!(Layout::new("a", "a", "tags", false).is_err());
        assert!(Layout::new("trunk", "branches", "tags", false).is_ok());
        // Overlap is fine when only trunk is used.
        assert!(Layout::new("trunk", "trunk", "trunk", true).is_ok());
    }

    #[test]
    fn discovers_files_and_strips_attic() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("CVSROOT")).unwrap();
        fs::create_dir_all(dir.path().join("proj/sub/Attic")).unwrap();
        fs::write(dir.path().join("proj/a.txt,v"), b"x").unwrap();
        fs::write(dir.path().join("proj/sub/Attic/gone.c,v"), b"x").unwrap();

        let project = Project::open(dir.path().join("proj")).unwrap();
        let files = project.discover_files().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].svn_path, "a.txt");
        assert_eq!(files[1].svn_path, "sub/gone.c");
        assert!(files[1].in_attic);
    }

    #[test]
    fn attic_conflict_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("CVSROOT")).unwrap();
        fs::create_dir_all(dir.path().join("proj/Attic")).unwrap();
        fs::write(dir.path().join("proj/a.txt,v"), b"x").unwrap();
        fs::write(dir.path().join("proj/Attic/a.txt,v"), b"x").unwrap();

        let project = Project::open(dir.path().join("proj")).unwrap();
        let err = project.discover_files().unwrap_err().to_string();
        assert!(err.contains("Attic"), "unexpected error: {}", err);
    }

    #[test]
    fn missing_cvsroot_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("proj")).unwrap();
        assert!(Project::open(dir.path().join("proj")).is_err());
    }

    #[test]
    fn cleans_symbol_names() {
        assert_eq!(clean_symbol_name("REL 1.0/final"), "REL_1.0_final");
        assert_eq!(clean_symbol_name("plain-name"), "plain-name");
    }

    #[test]
    fn symbol_transforms_apply_in_order() {
        let transforms = vec![
            SymbolTransform::parse(r"release-(\d+)_(\d+):release-$1.$2").unwrap(),
            SymbolTransform::parse(r"release-.*:misc").unwrap(),
        ];
        assert_eq!(transform_symbol_name(&transforms, "release-1_0"), "release-1.0");
        assert_eq!(transform_symbol_name(&transforms, "release-x"), "misc");
        assert_eq!(transform_symbol_name(&transforms, "other"), "other");
    }
}
