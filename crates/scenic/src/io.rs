//! Environment interfaces: include resolution and stream access.
//!
//! The compiler never touches the file system directly. Hosts inject an
//! [`IncludeResolver`] and a [`StreamFactory`]; the defaults here are
//! filesystem-backed, and [`MemoryStreams`] serves tests and sandboxed
//! embedding.

use std::{
    fs,
    path::{Path, PathBuf},
};

use ahash::AHashMap;

/// What a path is being opened for. Resolvers may search different
/// directories per purpose (scene includes vs. data files).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilePurpose {
    /// `#include` target.
    Include,
    /// `#fopen` data file.
    Data,
}

/// Maps a relative path from the scene source to an absolute path.
pub trait IncludeResolver {
    /// Returns the resolved path, or `None` when the file cannot be found.
    fn resolve(&self, relative: &str, purpose: FilePurpose) -> Option<PathBuf>;
}

/// Opens text streams for reading and writing.
pub trait StreamFactory {
    /// Reads the whole stream at `path` into a string.
    fn read(&mut self, path: &Path) -> std::io::Result<String>;

    /// Writes `contents` to `path`, replacing or appending.
    fn write(&mut self, path: &Path, contents: &str, append: bool) -> std::io::Result<()>;
}

/// The complete environment a parse session consumes: path resolution plus
/// stream access. Anything implementing both traits qualifies.
pub trait SceneEnv: IncludeResolver + StreamFactory {}

impl<T: IncludeResolver + StreamFactory> SceneEnv for T {}

/// Pairs any resolver with any stream factory into one environment.
#[derive(Debug, Default)]
pub struct Environment<R, S> {
    pub resolver: R,
    pub streams: S,
}

impl<R: IncludeResolver, S> IncludeResolver for Environment<R, S> {
    fn resolve(&self, relative: &str, purpose: FilePurpose) -> Option<PathBuf> {
        self.resolver.resolve(relative, purpose)
    }
}

impl<R, S: StreamFactory> StreamFactory for Environment<R, S> {
    fn read(&mut self, path: &Path) -> std::io::Result<String> {
        self.streams.read(path)
    }

    fn write(&mut self, path: &Path, contents: &str, append: bool) -> std::io::Result<()> {
        self.streams.write(path, contents, append)
    }
}

/// Filesystem resolver searching the scene directory then a library path list.
#[derive(Debug, Default)]
pub struct FsResolver {
    search_paths: Vec<PathBuf>,
}

impl FsResolver {
    #[must_use]
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    /// Adds a directory to the end of the search list.
    pub fn push_path(&mut self, path: PathBuf) {
        self.search_paths.push(path);
    }
}

impl IncludeResolver for FsResolver {
    fn resolve(&self, relative: &str, _purpose: FilePurpose) -> Option<PathBuf> {
        let direct = PathBuf::from(relative);
        if direct.is_file() {
            return Some(direct);
        }
        self.search_paths.iter().map(|dir| dir.join(relative)).find(|p| p.is_file())
    }
}

/// Filesystem stream factory.
#[derive(Debug, Default)]
pub struct FsStreams;

impl StreamFactory for FsStreams {
    fn read(&mut self, path: &Path) -> std::io::Result<String> {
        fs::read_to_string(path)
    }

    fn write(&mut self, path: &Path, contents: &str, append: bool) -> std::io::Result<()> {
        if append {
            use std::io::Write as _;
            let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(contents.as_bytes())
        } else {
            fs::write(path, contents)
        }
    }
}

/// In-memory resolver + factory for tests and sandboxed hosts.
///
/// Every known path resolves; reads return the stored text, writes replace
/// or append in the map. Written files can be read back within the same
/// session, matching `#fopen … write` followed by `#fopen … read`.
#[derive(Debug, Default)]
pub struct MemoryStreams {
    files: AHashMap<PathBuf, String>,
}

impl MemoryStreams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, contents: impl Into<String>) {
        self.files.insert(path.into(), contents.into());
    }

    #[must_use]
    pub fn get(&self, path: impl AsRef<Path>) -> Option<&str> {
        self.files.get(path.as_ref()).map(String::as_str)
    }
}

impl IncludeResolver for MemoryStreams {
    fn resolve(&self, relative: &str, _purpose: FilePurpose) -> Option<PathBuf> {
        let path = PathBuf::from(relative);
        self.files.contains_key(&path).then_some(path)
    }
}

impl StreamFactory for MemoryStreams {
    fn read(&mut self, path: &Path) -> std::io::Result<String> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, format!("{}", path.display())))
    }

    fn write(&mut self, path: &Path, contents: &str, append: bool) -> std::io::Result<()> {
        if append {
            self.files.entry(path.to_path_buf()).or_default().push_str(contents);
        } else {
            self.files.insert(path.to_path_buf(), contents.to_owned());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_memory_round_trip() {
        let mut streams = MemoryStreams::new();
        streams.insert("colors.inc", "#declare Red = rgb <1,0,0>;");
        let path = streams.resolve("colors.inc", FilePurpose::Include).unwrap();
        assert_eq!(streams.read(&path).unwrap(), "#declare Red = rgb <1,0,0>;");
        assert!(streams.resolve("missing.inc", FilePurpose::Include).is_none());
    }

    #[test]
    fn test_memory_append() {
        let mut streams = MemoryStreams::new();
        let path = PathBuf::from("out.txt");
        streams.write(&path, "1, ", false).unwrap();
        streams.write(&path, "2", true).unwrap();
        assert_eq!(streams.get("out.txt"), Some("1, 2"));
    }
}
