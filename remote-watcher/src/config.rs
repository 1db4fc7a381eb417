//! Configuration types for remote directory watching.

use std::path::PathBuf;
use std::time::Duration;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use wildmatch::WildMatch;

use crate::entry::{DirectoryEntry, EntryType};
use crate::error::{Result, WatchError};

/// Default interval between polls.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 60_000;

/// Default number of event groups the consumer channel holds before backpressure.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Configuration for a watched remote directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchConfig {
    /// Remote directory to poll.
    pub watched_directory: String,

    /// Interval between the end of one poll and the start of the next.
    pub poll_interval_ms: u64,

    /// Glob matched against entry names.
    pub name_filter: Option<String>,

    /// Regular expression matched against entry names.
    pub name_regex: Option<String>,

    /// Only consider entries of this type.
    pub type_filter: Option<EntryType>,

    /// Local directory mirroring matched objects.
    pub mirror_directory: Option<PathBuf>,

    /// Whether deletions are applied to the mirror.
    pub allow_mirror_deletion: bool,

    /// Skip the first-poll delete guard.
    pub disable_delete_guard: bool,

    /// Log mirror operations without performing them.
    pub dry_run: bool,

    /// Run a single poll and end the stream.
    pub one_shot: bool,

    /// Event groups buffered in the consumer channel.
    pub channel_capacity: usize,
}

impl WatchConfig {
    /// Create a new watch config for a remote directory.
    pub fn new(watched_directory: impl Into<String>) -> Self {
        Self {
            watched_directory: watched_directory.into(),
            ..Self::default()
        }
    }

    /// Parse a config from TOML.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| WatchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Only watch names matching a glob.
    pub fn with_name_filter(mut self, glob: impl Into<String>) -> Self {
        self.name_filter = Some(glob.into());
        self
    }

    /// Only watch names matching a regular expression.
    pub fn with_name_regex(mut self, pattern: impl Into<String>) -> Self {
        self.name_regex = Some(pattern.into());
        self
    }

    /// Only watch entries of one type.
    pub fn with_type_filter(mut self, entry_type: EntryType) -> Self {
        self.type_filter = Some(entry_type);
        self
    }

    /// Mirror matched objects into a local directory.
    pub fn with_mirror(mut self, directory: impl Into<PathBuf>) -> Self {
        self.mirror_directory = Some(directory.into());
        self
    }

    /// Apply deletions to the mirror.
    pub fn allow_mirror_deletion(mut self) -> Self {
        self.allow_mirror_deletion = true;
        self
    }

    /// Disable the first-poll delete guard.
    pub fn disable_delete_guard(mut self) -> Self {
        self.disable_delete_guard = true;
        self
    }

    /// Log mirror operations instead of performing them.
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    /// Stop after one poll.
    pub fn one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }

    /// Set the consumer channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Interval between polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Check the configuration for errors.
    pub fn validate(&self) -> Result<()> {
        if self.watched_directory.trim().is_empty() {
            return Err(WatchError::Config("watchedDirectory is required".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(WatchError::Config(
                "pollIntervalMs must be greater than zero".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(WatchError::Config(
                "channelCapacity must be greater than zero".into(),
            ));
        }
        if self.mirror_directory.is_none()
            && (self.allow_mirror_deletion || self.disable_delete_guard)
        {
            return Err(WatchError::Config(
                "mirror options require mirrorDirectory".into(),
            ));
        }
        self.entry_filter().map(|_| ())
    }

    /// Compile the name and type filters.
    pub fn entry_filter(&self) -> Result<EntryFilter> {
        let name = match (&self.name_filter, &self.name_regex) {
            (Some(_), Some(_)) => {
                return Err(WatchError::Config(
                    "nameFilter and nameRegex are mutually exclusive".into(),
                ));
            }
            (Some(glob), None) => NameFilter::Glob(WildMatch::new(glob)),
            (None, Some(pattern)) => NameFilter::Regex(
                Regex::new(pattern)
                    .map_err(|e| WatchError::Config(format!("invalid nameRegex: {e}")))?,
            ),
            (None, None) => NameFilter::Any,
        };

        Ok(EntryFilter {
            name,
            entry_type: self.type_filter,
        })
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            watched_directory: String::new(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            name_filter: None,
            name_regex: None,
            type_filter: None,
            mirror_directory: None,
            allow_mirror_deletion: false,
            disable_delete_guard: false,
            dry_run: false,
            one_shot: false,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Matcher for entry names.
#[derive(Debug, Clone)]
pub enum NameFilter {
    /// Every name matches.
    Any,

    /// Shell-style glob.
    Glob(WildMatch),

    /// Regular expression (unanchored).
    Regex(Regex),
}

impl NameFilter {
    /// Check whether a name passes the filter.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            NameFilter::Any => true,
            NameFilter::Glob(glob) => glob.matches(name),
            NameFilter::Regex(regex) => regex.is_match(name),
        }
    }
}

/// Compiled filter applied to both remote entries and mirrored files.
#[derive(Debug, Clone)]
pub struct EntryFilter {
    name: NameFilter,
    entry_type: Option<EntryType>,
}

impl EntryFilter {
    /// A filter that accepts everything.
    pub fn any() -> Self {
        Self {
            name: NameFilter::Any,
            entry_type: None,
        }
    }

    /// Check a remote entry against the name and type filters.
    pub fn accepts(&self, entry: &DirectoryEntry) -> bool {
        self.entry_type.is_none_or(|t| t == entry.entry_type) && self.name.matches(&entry.name)
    }

    /// Check a name against the name filter only.
    pub fn accepts_name(&self, name: &str) -> bool {
        self.name.matches(name)
    }
}
