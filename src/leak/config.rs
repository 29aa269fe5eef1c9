use std::{borrow::Cow, env, fmt, str::FromStr};

/// Environment variable selecting the [`Level`].
pub const ENV_LEVEL: &str = "LEAK_DETECTION_LEVEL";
/// Environment variable overriding the sampling interval (LIGHT and DEBUG only).
pub const ENV_SAMPLING_INTERVAL: &str = "LEAK_DETECTION_SAMPLING_INTERVAL";
/// Environment variable overriding the trace count (DEBUG only).
pub const ENV_TRACE_COUNT: &str = "LEAK_DETECTION_TRACE_COUNT";

pub const DEFAULT_LIGHT_SAMPLING_INTERVAL: u32 = 128;
pub const DEFAULT_TRACE_COUNT: usize = 4;
/// Largest trace count [`LeakConfig::validate`] accepts.
pub const MAX_TRACE_COUNT: usize = 1 << 16;

/// Frames of this crate never help locate a leak, so they are elided from
/// rendered traces.
const DEFAULT_SUPPRESSED_FRAMES: &[&str] = &[
    "backtrace::",
    "refguard::leak::",
    "refguard::object::",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid LEAK_DETECTION_LEVEL={0:?}; acceptable values are DISABLED, LIGHT, FULL, DEBUG, or a number 0-3")]
    InvalidLevel(String),
    #[error("invalid {name}={value:?}; expected a non-negative integer")]
    InvalidNumber { name: &'static str, value: String },
    #[error("sampling interval must be at least 1")]
    ZeroSamplingInterval,
    #[error("trace count {count} exceeds the maximum of {max}")]
    TraceCountTooLarge { count: usize, max: usize },
}

/// How much work the leak detector does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Level {
    /// No tracking at all; registration never allocates.
    Disabled,
    /// Every Nth object is tracked, no traces are recorded.
    Light,
    /// Every object is tracked, no traces are recorded.
    #[default]
    Full,
    /// Every object is tracked by default and its allocation and use sites
    /// are recorded.
    Debug,
}

impl Level {
    pub const ALL: [Level; 4] = [Level::Disabled, Level::Light, Level::Full, Level::Debug];

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Disabled => "DISABLED",
            Level::Light => "LIGHT",
            Level::Full => "FULL",
            Level::Debug => "DEBUG",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Level::ALL
            .into_iter()
            .enumerate()
            .find(|(ordinal, level)| {
                s.eq_ignore_ascii_case(level.as_str()) || s == ordinal.to_string()
            })
            .map(|(_, level)| level)
            .ok_or_else(|| ConfigError::InvalidLevel(s.to_owned()))
    }
}

/// Detector configuration, fixed once the detector is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakConfig {
    level: Level,
    sampling_interval: u32,
    trace_count: usize,
    suppressed_frames: Vec<Cow<'static, str>>,
}

impl Default for LeakConfig {
    fn default() -> Self {
        Self::new(Level::default())
    }
}

impl LeakConfig {
    /// The defaults for `level`: LIGHT samples 1 in 128, DEBUG keeps 4 traces.
    pub fn new(level: Level) -> Self {
        let (sampling_interval, trace_count) = match level {
            Level::Disabled | Level::Full => (1, 0),
            Level::Light => (DEFAULT_LIGHT_SAMPLING_INTERVAL, 0),
            Level::Debug => (1, DEFAULT_TRACE_COUNT),
        };
        Self {
            level,
            sampling_interval,
            trace_count,
            suppressed_frames: DEFAULT_SUPPRESSED_FRAMES
                .iter()
                .map(|s| Cow::Borrowed(*s))
                .collect(),
        }
    }

    /// Only LIGHT and DEBUG honor a custom interval; FULL always tracks everything.
    /// An interval of 0 fails [`validate`](Self::validate) and otherwise
    /// samples like 1.
    pub fn with_sampling_interval(mut self, interval: u32) -> Self {
        if matches!(self.level, Level::Light | Level::Debug) {
            self.sampling_interval = interval;
        }
        self
    }

    /// Only DEBUG records traces.
    pub fn with_trace_count(mut self, count: usize) -> Self {
        if self.level == Level::Debug {
            self.trace_count = count;
        }
        self
    }

    /// Elide frames whose symbol name contains `frame` from rendered traces.
    pub fn with_suppressed_frame(mut self, frame: impl Into<Cow<'static, str>>) -> Self {
        self.suppressed_frames.push(frame.into());
        self
    }

    /// Reject settings that cannot be tracked sensibly. A detector built
    /// with [`LeakDetector::new`](super::LeakDetector::new) does not call
    /// this; [`LeakDetector::try_new`](super::LeakDetector::try_new) does.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.sampling_interval == 0 {
            return Err(ConfigError::ZeroSamplingInterval);
        }
        if self.trace_count > MAX_TRACE_COUNT {
            return Err(ConfigError::TraceCountTooLarge {
                count: self.trace_count,
                max: MAX_TRACE_COUNT,
            });
        }
        Ok(self)
    }

    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let level = match lookup(ENV_LEVEL) {
            Some(s) => s.parse()?,
            None => Level::default(),
        };
        let mut config = Self::new(level);
        if let Some(interval) = lookup(ENV_SAMPLING_INTERVAL) {
            config = config.with_sampling_interval(parse_number(ENV_SAMPLING_INTERVAL, &interval)?);
        }
        if let Some(count) = lookup(ENV_TRACE_COUNT) {
            config = config.with_trace_count(parse_number(ENV_TRACE_COUNT, &count)?);
        }
        config.validate()
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn sampling_interval(&self) -> u32 {
        self.sampling_interval
    }

    pub fn trace_count(&self) -> usize {
        self.trace_count
    }

    pub fn suppressed_frames(&self) -> &[Cow<'static, str>] {
        &self.suppressed_frames
    }
}

fn parse_number<N: FromStr>(name: &'static str, value: &str) -> Result<N, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        name,
        value: value.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Option<String> {
        let vars: HashMap<_, _> = vars.iter().map(|(k, v)| (*k, v.to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn level_parses_names_and_ordinals() {
        assert_eq!("debug".parse::<Level>(), Ok(Level::Debug));
        assert_eq!(" Light ".parse::<Level>(), Ok(Level::Light));
        assert_eq!("0".parse::<Level>(), Ok(Level::Disabled));
        assert_eq!("2".parse::<Level>(), Ok(Level::Full));
        assert_eq!(
            "paranoid".parse::<Level>(),
            Err(ConfigError::InvalidLevel("paranoid".to_owned()))
        );
        assert!("4".parse::<Level>().is_err());
    }

    #[test]
    fn defaults_follow_level() {
        let full = LeakConfig::default();
        assert_eq!(full.level(), Level::Full);
        assert_eq!(full.sampling_interval(), 1);
        assert_eq!(full.trace_count(), 0);

        let light = LeakConfig::new(Level::Light);
        assert_eq!(light.sampling_interval(), 128);

        let debug = LeakConfig::new(Level::Debug);
        assert_eq!(debug.sampling_interval(), 1);
        assert_eq!(debug.trace_count(), 4);
    }

    #[test]
    fn overrides_are_ignored_where_the_level_forbids_them() {
        let full = LeakConfig::new(Level::Full).with_sampling_interval(7).with_trace_count(9);
        assert_eq!(full.sampling_interval(), 1);
        assert_eq!(full.trace_count(), 0);

        let light = LeakConfig::new(Level::Light).with_sampling_interval(7).with_trace_count(9);
        assert_eq!(light.sampling_interval(), 7);
        assert_eq!(light.trace_count(), 0);
    }

    #[test]
    fn env_lookup() {
        let config = LeakConfig::from_lookup(lookup(&[
            (ENV_LEVEL, "debug"),
            (ENV_SAMPLING_INTERVAL, "3"),
            (ENV_TRACE_COUNT, "10"),
        ]))
        .unwrap();
        assert_eq!(config.level(), Level::Debug);
        assert_eq!(config.sampling_interval(), 3);
        assert_eq!(config.trace_count(), 10);

        let config = LeakConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, LeakConfig::default());
    }

    #[test]
    fn env_lookup_errors() {
        assert_eq!(
            LeakConfig::from_lookup(lookup(&[(ENV_LEVEL, "loud")])),
            Err(ConfigError::InvalidLevel("loud".to_owned()))
        );
        assert_eq!(
            LeakConfig::from_lookup(lookup(&[(ENV_LEVEL, "light"), (ENV_SAMPLING_INTERVAL, "x")])),
            Err(ConfigError::InvalidNumber {
                name: ENV_SAMPLING_INTERVAL,
                value: "x".to_owned()
            })
        );
        assert_eq!(
            LeakConfig::from_lookup(lookup(&[(ENV_LEVEL, "light"), (ENV_SAMPLING_INTERVAL, "0")])),
            Err(ConfigError::ZeroSamplingInterval)
        );
    }

    #[test]
    fn oversized_trace_count_is_rejected() {
        assert_eq!(
            LeakConfig::from_lookup(lookup(&[
                (ENV_LEVEL, "debug"),
                (ENV_TRACE_COUNT, "18446744073709551615"),
            ])),
            Err(ConfigError::TraceCountTooLarge {
                count: usize::MAX,
                max: MAX_TRACE_COUNT
            })
        );
        assert!(LeakConfig::new(Level::Debug)
            .with_trace_count(MAX_TRACE_COUNT)
            .validate()
            .is_ok());
        assert!(LeakConfig::new(Level::Debug)
            .with_trace_count(MAX_TRACE_COUNT + 1)
            .validate()
            .is_err());
    }
}
