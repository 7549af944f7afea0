//! Map real filesystem paths to archive paths.
//!
//! Stripping and grafting mean the archive hierarchy doesn't have to mirror
//! the filesystem: prefixes can be dropped or rewritten, and parents can be
//! synthesized out of thin air. Every mapping yields a list of components
//! starting with the archive root (named `""`); components with no
//! filesystem counterpart carry `fs_path = None`.

use anyhow::{Context, Result, ensure};
use camino::{Utf8Path, Utf8PathBuf};

/// One step along an archive path.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Component {
    pub name: String,
    /// The real directory behind this component, if there is one.
    pub fs_path: Option<Utf8PathBuf>,
}

pub type Dirp = Vec<Component>;

/// A graft rewrites one real path prefix into a different archive prefix.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Graft {
    pub old: Utf8PathBuf,
    pub new: Utf8PathBuf,
}

impl Graft {
    /// Parse the command-line form, `old_path=new_path`.
    pub fn parse(s: &str) -> Result<Self> {
        let Some((old, new)) = s.split_once('=') else {
            anyhow::bail!("A graft point must be of the form old_path=new_path");
        };
        ensure!(!old.is_empty() && !new.is_empty(), "A graft point cannot be empty");
        Ok(Self {
            old: old.into(),
            new: new.into(),
        })
    }
}

/// How real paths turn into archive paths. The strip and graft variants are
/// mutually exclusive on the command line.
#[derive(Debug, Clone, Default)]
pub enum Mapping {
    #[default]
    Identity,
    /// Strip whichever source root prefixes the path.
    Strip(Vec<Utf8PathBuf>),
    /// Strip one explicit prefix.
    StripPath(Utf8PathBuf),
    Graft(Vec<Graft>),
}

impl Mapping {
    /// Archive components for a real directory path (absolute, no trailing
    /// slash except for the root itself).
    pub fn components(&self, dir: &Utf8Path) -> Dirp {
        match self {
            Mapping::Identity => path_components(dir),
            Mapping::Strip(roots) => stripped_components(dir, roots),
            Mapping::StripPath(p) => stripped_components(dir, std::slice::from_ref(p)),
            Mapping::Graft(grafts) => grafted_components(dir, grafts),
        }
    }
}

/// `/a/b` becomes `[("", /), ("a", /a), ("b", /a/b)]`.
pub fn path_components(path: &Utf8Path) -> Dirp {
    debug_assert!(path.is_absolute(), "expected an absolute path, got {path}");
    let mut result = vec![Component {
        name: String::new(),
        fs_path: Some(Utf8PathBuf::from("/")),
    }];
    let mut full = Utf8PathBuf::from("/");
    for part in path.strip_prefix("/").unwrap_or(path).components() {
        full.push(part);
        result.push(Component {
            name: part.as_str().to_owned(),
            fs_path: Some(full.clone()),
        });
    }
    result
}

/// Like [`path_components`], but the longest matching prefix collapses into
/// the archive root. Paths no prefix matches fall back to the identity map.
pub fn stripped_components(path: &Utf8Path, prefixes: &[Utf8PathBuf]) -> Dirp {
    let mut sorted: Vec<&Utf8PathBuf> = prefixes.iter().collect();
    sorted.sort_by_key(|p| std::cmp::Reverse(p.as_str().len()));

    for prefix in sorted {
        if let Ok(rest) = path.strip_prefix(prefix) {
            let mut result = vec![Component {
                name: String::new(),
                fs_path: Some(prefix.clone()),
            }];
            let mut full = prefix.clone();
            for part in rest.components() {
                full.push(part);
                result.push(Component {
                    name: part.as_str().to_owned(),
                    fs_path: Some(full.clone()),
                });
            }
            return result;
        }
    }
    path_components(path)
}

/// Rewrite `old` to `new` for the first matching graft: the new prefix's
/// components are synthetic (no filesystem counterpart), the tail under the
/// graft point keeps its real paths.
pub fn grafted_components(path: &Utf8Path, grafts: &[Graft]) -> Dirp {
    for graft in grafts {
        if let Ok(rest) = path.strip_prefix(&graft.old) {
            let mut result = vec![Component {
                name: String::new(),
                fs_path: None,
            }];
            for part in graft.new.strip_prefix("/").unwrap_or(&graft.new).components() {
                result.push(Component {
                    name: part.as_str().to_owned(),
                    fs_path: None,
                });
            }
            let mut full = graft.old.clone();
            for part in rest.components() {
                full.push(part);
                result.push(Component {
                    name: part.as_str().to_owned(),
                    fs_path: Some(full.clone()),
                });
            }
            return result;
        }
    }
    path_components(path)
}

/// Absolutize the command line's source paths and drop any that another
/// source already contains. Index and save must agree on this normal form,
/// since it's what entry paths are matched against.
pub fn normalize_sources(sources: &[Utf8PathBuf]) -> Result<Vec<Utf8PathBuf>> {
    let mut absolute = Vec::with_capacity(sources.len());
    for s in sources {
        let abs = std::path::absolute(s.as_std_path())
            .with_context(|| format!("Couldn't resolve {s}"))?;
        let mut abs = Utf8PathBuf::from_path_buf(abs)
            .map_err(|p| anyhow::anyhow!("Non-UTF-8 path {p:?}"))?;
        if abs.as_str().len() > 1 && abs.as_str().ends_with('/') {
            abs = Utf8PathBuf::from(abs.as_str().trim_end_matches('/'));
        }
        absolute.push(abs);
    }
    absolute.sort();
    absolute.dedup();

    // Sorted, so a source's container (if any) is the last one we kept.
    let mut reduced: Vec<Utf8PathBuf> = Vec::new();
    for s in absolute {
        let contained = reduced
            .last()
            .is_some_and(|prev| s.strip_prefix(prev).is_ok());
        if !contained {
            reduced.push(s);
        }
    }
    Ok(reduced)
}

/// Split an index path into its parent directory and file name, treating a
/// trailing slash (a directory entry) as an empty file name.
pub fn split_dir_file(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => {
            let dir = if i == 0 { "/" } else { &path[..i] };
            (dir, &path[i + 1..])
        }
        None => ("", path),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn names(dirp: &Dirp) -> Vec<&str> {
        dirp.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn identity() {
        let dirp = path_components(Utf8Path::new("/home/someuser"));
        assert_eq!(names(&dirp), ["", "home", "someuser"]);
        assert_eq!(dirp[2].fs_path.as_deref(), Some(Utf8Path::new("/home/someuser")));

        assert_eq!(names(&path_components(Utf8Path::new("/"))), [""]);
    }

    #[test]
    fn strip_takes_longest_prefix() {
        let roots = vec![Utf8PathBuf::from("/foo"), Utf8PathBuf::from("/foo/bar")];
        let dirp = stripped_components(Utf8Path::new("/foo/bar/baz"), &roots);
        assert_eq!(names(&dirp), ["", "baz"]);
        // The collapsed root remembers the real directory it stands for.
        assert_eq!(dirp[0].fs_path.as_deref(), Some(Utf8Path::new("/foo/bar")));
        assert_eq!(dirp[1].fs_path.as_deref(), Some(Utf8Path::new("/foo/bar/baz")));
    }

    #[test]
    fn strip_whole_path() {
        let roots = vec![Utf8PathBuf::from("/foo")];
        let dirp = stripped_components(Utf8Path::new("/foo"), &roots);
        assert_eq!(names(&dirp), [""]);
    }

    #[test]
    fn strip_falls_back_without_a_match() {
        let roots = vec![Utf8PathBuf::from("/elsewhere")];
        let dirp = stripped_components(Utf8Path::new("/foo/bar"), &roots);
        assert_eq!(names(&dirp), ["", "foo", "bar"]);
    }

    #[test]
    fn graft_synthesizes_parents() {
        let grafts = vec![Graft::parse("/data=/backup/nightly").unwrap()];
        let dirp = grafted_components(Utf8Path::new("/data/db"), &grafts);
        assert_eq!(names(&dirp), ["", "backup", "nightly", "db"]);
        // Grafted parents have no filesystem counterpart.
        assert_eq!(dirp[1].fs_path, None);
        assert_eq!(dirp[2].fs_path, None);
        assert_eq!(dirp[3].fs_path.as_deref(), Some(Utf8Path::new("/data/db")));
    }

    #[test]
    fn graft_to_root() {
        let grafts = vec![Graft::parse("/foo=/").unwrap()];
        let dirp = grafted_components(Utf8Path::new("/foo/x"), &grafts);
        assert_eq!(names(&dirp), ["", "x"]);
        assert_eq!(dirp[0].fs_path, None);
    }

    #[test]
    fn graft_parse_rejects_nonsense() {
        assert!(Graft::parse("no-equals").is_err());
        assert!(Graft::parse("=/x").is_err());
        assert!(Graft::parse("/x=").is_err());
    }

    #[test]
    fn sources_reduce_to_their_containers() -> Result<()> {
        let sources = vec![
            Utf8PathBuf::from("/a/b"),
            Utf8PathBuf::from("/a"),
            Utf8PathBuf::from("/ab"),
            Utf8PathBuf::from("/a/c/"),
        ];
        let reduced = normalize_sources(&sources)?;
        assert_eq!(reduced, [Utf8PathBuf::from("/a"), Utf8PathBuf::from("/ab")]);
        Ok(())
    }

    #[test]
    fn dir_file_split() {
        assert_eq!(split_dir_file("/a/b"), ("/a", "b"));
        assert_eq!(split_dir_file("/a/"), ("/a", ""));
        assert_eq!(split_dir_file("/b"), ("/", "b"));
        assert_eq!(split_dir_file("/"), ("/", ""));
    }
}
