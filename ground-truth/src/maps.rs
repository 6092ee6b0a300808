//! Resolution of live virtual addresses to file offsets of the traced binary.
//!
//! The process memory layout is read once, from a Linux `/proc/<pid>/maps` style description,
//! the first time an address is resolved. Only ranges backed by the traced binary are kept.
//! The layout is never re-read afterwards, so code of the traced binary that is mapped after
//! the first resolution (a late `mmap` of the same file) is not resolvable and is silently
//! dropped by callers.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::Hex;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed memory mapping on line {line}: {text:?}")]
    Malformed { line: usize, text: String },

    #[error("unable to read memory mappings")]
    Io(#[from] io::Error),
}

/// A half-open range `[begin, end)` of virtual addresses backed by the traced binary at
/// `file_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub begin: u64,
    pub end: u64,
    pub file_offset: u64,
}

impl MemoryRange {
    pub fn contains(&self, vaddr: u64) -> bool {
        self.begin <= vaddr && vaddr < self.end
    }

    pub fn translate(&self, vaddr: u64) -> Option<u64> {
        self.contains(vaddr)
            .then(|| vaddr - self.begin + self.file_offset)
    }
}

/// One parsed line of a memory mapping description.
///
/// # Format
///
/// `begin-end perms offset dev inode [path]`, with hexadecimal `begin`, `end` and `offset`.
/// Mappings with a zero inode (anonymous memory, `[heap]`, `[stack]`, ...) carry no path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingLine<'a> {
    pub begin: u64,
    pub end: u64,
    pub perms: &'a str,
    pub offset: u64,
    pub inode: u64,
    pub path: Option<&'a str>,
}

impl<'a> MappingLine<'a> {
    pub fn parse(text: &'a str) -> Option<Self> {
        let mut rest = text;
        let range = next_field(&mut rest)?;
        let perms = next_field(&mut rest)?;
        let offset = next_field(&mut rest)?;
        let _dev = next_field(&mut rest)?;
        let inode = next_field(&mut rest)?;

        let (begin, end) = range.split_once('-')?;
        let begin = u64::from_str_radix(begin, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        if end < begin || perms.len() != 4 {
            return None;
        }
        let offset = u64::from_str_radix(offset, 16).ok()?;
        let inode = inode.parse::<u64>().ok()?;

        // Paths may contain spaces, so everything after the inode belongs to the path.
        let path = rest.trim();
        let path = (inode != 0 && !path.is_empty()).then_some(path);

        Some(Self {
            begin,
            end,
            perms,
            offset,
            inode,
            path,
        })
    }
}

fn next_field<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let trimmed = rest.trim_start();
    if trimmed.is_empty() {
        return None;
    }
    let (field, remaining) = trimmed
        .split_once(char::is_whitespace)
        .unwrap_or((trimmed, ""));
    *rest = remaining;
    Some(field)
}

/// Deduplicates filenames so that identity checks are a pointer comparison.
#[derive(Debug, Default)]
pub struct FilenamePool {
    names: HashSet<Arc<Path>>,
}

impl FilenamePool {
    pub fn intern(&mut self, path: &Path) -> Arc<Path> {
        if let Some(name) = self.names.get(path) {
            return Arc::clone(name);
        }
        let name: Arc<Path> = Arc::from(path);
        self.names.insert(Arc::clone(&name));
        name
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Ranges of the traced binary ordered by their first address.
#[derive(Debug, Default)]
pub struct AddressMap {
    ranges: BTreeMap<u64, MemoryRange>,
}

impl AddressMap {
    /// Builds the map from a full mapping description, keeping only the ranges of `target`.
    ///
    /// `target` must have been interned in `pool`. Every line is validated, including the
    /// lines that are discarded afterwards.
    pub fn from_maps(text: &str, target: &Arc<Path>, pool: &mut FilenamePool) -> Result<Self, Error> {
        let mut ranges = BTreeMap::new();

        for (n, text) in text.lines().enumerate() {
            if text.trim().is_empty() {
                continue;
            }
            let Some(line) = MappingLine::parse(text) else {
                return Err(Error::Malformed {
                    line: n + 1,
                    text: text.to_string(),
                });
            };
            let Some(path) = line.path else {
                continue;
            };

            let filename = pool.intern(Path::new(path));
            if !Arc::ptr_eq(&filename, target) {
                continue;
            }

            ranges.insert(
                line.begin,
                MemoryRange {
                    begin: line.begin,
                    end: line.end,
                    file_offset: line.offset,
                },
            );
        }

        Ok(Self { ranges })
    }

    pub fn resolve(&self, vaddr: u64) -> Option<u64> {
        let (_, range) = self.ranges.range(..=vaddr).next_back()?;
        range.translate(vaddr)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Provider of the process memory mapping description.
pub trait MapsSource {
    fn read_maps(&self) -> io::Result<String>;
}

/// Reads the mappings of the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcSelfMaps;

impl MapsSource for ProcSelfMaps {
    fn read_maps(&self) -> io::Result<String> {
        std::fs::read_to_string("/proc/self/maps")
    }
}

/// A fixed mapping description, e.g. one saved from an earlier run.
#[derive(Debug, Clone)]
pub struct StaticMaps(pub String);

impl MapsSource for StaticMaps {
    fn read_maps(&self) -> io::Result<String> {
        Ok(self.0.clone())
    }
}

pub struct Resolver<S = ProcSelfMaps> {
    target: Arc<Path>,
    pool: Mutex<FilenamePool>,
    source: S,
    map: OnceLock<AddressMap>,
}

impl<S: MapsSource> Resolver<S> {
    pub fn new(target: impl Into<PathBuf>, source: S) -> Self {
        let mut pool = FilenamePool::default();
        let target = pool.intern(&target.into());
        Self {
            target,
            pool: Mutex::new(pool),
            source,
            map: OnceLock::new(),
        }
    }

    /// Returns the file offset of `vaddr` within the traced binary.
    ///
    /// `Ok(None)` is a routine miss: the address belongs to some other mapping.
    pub fn resolve(&self, vaddr: u64) -> Result<Option<u64>, Error> {
        let offset = self.map()?.resolve(vaddr);
        if offset.is_none() {
            tracing::trace!(vaddr = %Hex(vaddr), "address is outside of the traced binary");
        }
        Ok(offset)
    }

    /// Returns the address map, building it if this is the first request.
    ///
    /// Concurrent first requests wait for a single build.
    pub fn map(&self) -> Result<&AddressMap, Error> {
        if let Some(map) = self.map.get() {
            return Ok(map);
        }

        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(map) = self.map.get() {
            return Ok(map);
        }

        let text = self.source.read_maps()?;
        let map = AddressMap::from_maps(&text, &self.target, &mut pool)?;

        tracing::debug! {
            target = %self.target.display(),
            ranges = map.len(),
            filenames = pool.len(),
            "built address map"
        };
        if map.is_empty() {
            tracing::warn!(target = %self.target.display(), "traced binary is not mapped");
        }

        Ok(self.map.get_or_init(|| map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    const MAPS: &str = "\
00400000-00401000 r--p 00000000 08:01 1234                               /opt/bin/target
00401000-00405000 r-xp 00001000 08:01 1234                               /opt/bin/target
00405000-00406000 rw-p 00005000 08:01 1234                               /opt/bin/target
01b2c000-01b4d000 rw-p 00000000 00:00 0                                  [heap]
7f0000000000-7f0000021000 r-xp 00000000 08:01 5678                       /usr/lib/libc.so.6
7f0000100000-7f0000101000 rw-p 00000000 00:00 0
7ffd1a000000-7ffd1a021000 rw-p 00000000 00:00 0                          [stack]
";

    fn resolver() -> Resolver<StaticMaps> {
        Resolver::new("/opt/bin/target", StaticMaps(MAPS.to_string()))
    }

    #[test]
    fn resolves_addresses_in_target() {
        let resolver = resolver();
        assert_eq!(resolver.resolve(0x400000).unwrap(), Some(0));
        assert_eq!(resolver.resolve(0x401010).unwrap(), Some(0x1010));
        assert_eq!(resolver.resolve(0x405fff).unwrap(), Some(0x5fff));
    }

    #[test]
    fn ignores_other_mappings() {
        let resolver = resolver();
        assert_eq!(resolver.resolve(0x7f0000000100).unwrap(), None);
        assert_eq!(resolver.resolve(0x01b2c010).unwrap(), None);
        assert_eq!(resolver.map().unwrap().len(), 3);
    }

    #[test]
    fn misses_gaps_and_range_ends() {
        let resolver = resolver();
        assert_eq!(resolver.resolve(0x3fffff).unwrap(), None);
        assert_eq!(resolver.resolve(0x406000).unwrap(), None);
    }

    #[test]
    fn parses_paths_with_spaces() {
        let line = "10000-11000 r-xp 00002000 fd:00 42   /tmp/my binary (deleted)";
        let parsed = MappingLine::parse(line).unwrap();
        assert_eq!(parsed.begin, 0x10000);
        assert_eq!(parsed.end, 0x11000);
        assert_eq!(parsed.offset, 0x2000);
        assert_eq!(parsed.perms, "r-xp");
        assert_eq!(parsed.path, Some("/tmp/my binary (deleted)"));
    }

    #[test]
    fn anonymous_mappings_have_no_path() {
        let line = "01b2c000-01b4d000 rw-p 00000000 00:00 0    [heap]";
        assert_eq!(MappingLine::parse(line).unwrap().path, None);
    }

    #[test]
    fn rejects_malformed_mappings() {
        let maps = "00400000-00401000 r--p 00000000 08:01 1234 /opt/bin/target\nnot a mapping\n";
        let resolver = Resolver::new("/opt/bin/target", StaticMaps(maps.to_string()));
        match resolver.resolve(0x400000) {
            Err(Error::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl MapsSource for Counting {
        fn read_maps(&self) -> io::Result<String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(MAPS.to_string())
        }
    }

    #[test]
    fn map_is_built_once() {
        let resolver = Resolver::new("/opt/bin/target", Counting::default());
        assert_eq!(resolver.resolve(0x500000).unwrap(), None);
        assert_eq!(resolver.resolve(0x600000).unwrap(), None);
        assert_eq!(resolver.resolve(0x401000).unwrap(), Some(0x1000));
        assert_eq!(resolver.source.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_first_use_builds_map_once() {
        const THREADS: usize = 8;

        let resolver = Resolver::new("/opt/bin/target", Counting::default());
        let start = Barrier::new(THREADS);

        let results: Vec<Vec<Option<u64>>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        start.wait();
                        [0x400000, 0x401010, 0x405fff, 0x406000, 0x7f0000000100]
                            .into_iter()
                            .map(|vaddr| resolver.resolve(vaddr).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(resolver.source.0.load(Ordering::SeqCst), 1);
        for result in &results {
            assert_eq!(result, &vec![Some(0), Some(0x1010), Some(0x5fff), None, None]);
        }
    }

    #[test]
    fn pool_deduplicates_names() {
        let mut pool = FilenamePool::default();
        let a = pool.intern(Path::new("/lib/a.so"));
        let b = pool.intern(Path::new("/lib/a.so"));
        let c = pool.intern(Path::new("/lib/c.so"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(pool.len(), 2);
    }
}
