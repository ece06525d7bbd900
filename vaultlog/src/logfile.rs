//! The `Logfile` implementation: file naming, size based rotation and retention.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use crate::{Domain, FILE_EXTENSION};

/// The active log file of an engine.
///
/// The path is memoized. A new one is picked on the first write of the engine's
/// lifetime and whenever the current file grew beyond the size limit.
pub(crate) struct Logfile {
    domain: Arc<Domain>,
    size_limit: u64,
    current: Option<PathBuf>,
}

impl Logfile {
    const NAME_SEPARATOR: char = '_';
    const DATETIME_FORMAT: &'static str = "%Y%m%d%H%M%S";

    #[inline]
    pub(crate) fn new(domain: Arc<Domain>, size_limit: u64) -> Self {
        Self { domain, size_limit, current: None }
    }

    /// The path of the active file, if one has been picked.
    #[inline]
    pub(crate) fn current(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    /// Appends all parts to the active file, in order.
    ///
    /// After a failure the file may end with a torn chunk, the next write starts a
    /// new file.
    pub(crate) fn write(&mut self, parts: &[&[u8]]) -> io::Result<()> {
        let result = Self::append(self.active_path()?, parts);
        if result.is_err() {
            self.current = None;
        }
        result
    }

    fn append(path: &Path, parts: &[&[u8]]) -> io::Result<()> {
        let mut file = fs::OpenOptions::new().append(true).create(true).open(path)?;
        for part in parts {
            file.write_all(part)?;
        }
        file.flush()?;
        file.sync_data()
    }

    fn active_path(&mut self) -> io::Result<&Path> {
        let rotate = match &self.current {
            None => true,
            Some(path) => match fs::metadata(path) {
                Ok(metadata) => metadata.len() > self.size_limit,
                // Deleted by a retention sweep.
                Err(err) if err.kind() == io::ErrorKind::NotFound => true,
                Err(err) => return Err(err),
            },
        };

        if rotate {
            fs::create_dir_all(&self.domain.directory)?;
            let path = Self::fresh_path(&self.domain, chrono::Local::now());
            tracing::info!(path = %path.display(), "switching to a new log file");
            self.current = Some(path);
        }

        self.current.as_deref().ok_or_else(|| io::Error::other("no active log file"))
    }

    /// `{prefix}_{YYYYMMDDHHMMSS}.log`, with `_{n}` appended while the name is taken.
    pub(crate) fn fresh_path(
        domain: &Domain,
        datetime: chrono::DateTime<chrono::Local>,
    ) -> PathBuf {
        let stem = format!(
            "{}{}{}",
            domain.prefix,
            Self::NAME_SEPARATOR,
            datetime.format(Self::DATETIME_FORMAT)
        );

        let mut path = domain.directory.join(format!("{stem}.{FILE_EXTENSION}"));
        let mut suffix = 0;
        while path.exists() {
            suffix += 1;
            path = domain.directory.join(format!(
                "{stem}{}{suffix}.{FILE_EXTENSION}",
                Self::NAME_SEPARATOR
            ));
        }
        path
    }

    /// Parses a name generated by [`Self::fresh_path`] for `prefix` into its
    /// generation: the datetime digits and the collision suffix (`0` if absent).
    fn generation(prefix: &str, name: &str) -> Option<(u64, u64)> {
        let stem = name.strip_suffix(FILE_EXTENSION)?.strip_suffix('.')?;
        let rest = stem.strip_prefix(prefix)?.strip_prefix(Self::NAME_SEPARATOR)?;

        let number = |s: &str| match s.bytes().all(|b| b.is_ascii_digit()) {
            true => s.parse::<u64>().ok(),
            false => None,
        };
        let (datetime, suffix) = match rest.split_once(Self::NAME_SEPARATOR) {
            None => (rest, 0),
            Some((datetime, suffix)) => (datetime, number(suffix)?),
        };
        if datetime.len() != 14 {
            return None;
        }
        Some((number(datetime)?, suffix))
    }
}

/// A log file found in the domain directory.
#[derive(Clone, Debug)]
pub(crate) struct Entry {
    pub(crate) path: PathBuf,
    pub(crate) len: u64,
    pub(crate) modified: SystemTime,
    generation: (u64, u64),
}

/// Lists the log files of the domain, newest first.
pub(crate) fn logfiles(domain: &Domain) -> io::Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(&domain.directory)? {
        let entry = entry?;
        let name = entry.file_name();
        let generation = name.to_str().and_then(|name| Logfile::generation(&domain.prefix, name));
        let Some(generation) = generation else { continue };

        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        entries.push(Entry {
            path: entry.path(),
            len: metadata.len(),
            modified: metadata.modified()?,
            generation,
        });
    }

    // Names are monotonic as well, they break ties within the timestamp resolution.
    entries.sort_by(|a, b| {
        b.modified.cmp(&a.modified).then_with(|| b.generation.cmp(&a.generation))
    });
    Ok(entries)
}

/// Deletes log files of the domain.
///
/// Walking from the newest file, sizes are accumulated; every file at which the
/// running total exceeds `size_limit` is deleted, except the newest one. With
/// `max_age`, files not modified within that duration are deleted as well.
///
/// Returns the deleted paths.
pub(crate) fn sweep(
    domain: &Domain,
    size_limit: u64,
    max_age: Option<Duration>,
) -> io::Result<Vec<PathBuf>> {
    let expires = max_age.and_then(|age| SystemTime::now().checked_sub(age));

    let mut total = 0u64;
    let mut deleted = Vec::new();
    for (index, entry) in logfiles(domain)?.into_iter().enumerate() {
        total = total.saturating_add(entry.len);
        let over_budget = index > 0 && total > size_limit;
        let expired = expires.is_some_and(|expires| entry.modified < expires);

        if over_budget || expired {
            match fs::remove_file(&entry.path) {
                Ok(()) => {
                    tracing::info!(
                        path = %entry.path.display(),
                        over_budget,
                        expired,
                        "deleted log file"
                    );
                    deleted.push(entry.path);
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
    }
    Ok(deleted)
}
