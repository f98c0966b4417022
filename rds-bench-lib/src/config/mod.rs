//! Validated, strongly typed run configuration.
//!
//! A [`Config`] only exists when every invariant holds: the engine never
//! revalidates and never starts a partial run.

use std::{path::Path, str::FromStr, time::Duration};

use rama::telemetry::tracing;

use crate::sampler::{SelectionError, WeightedTable};

mod file;

pub use self::file::{CommandFile, ConfigFile, GeneralFile, KeyspaceFile, TargetFile, ValueFile};


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// RESP framed sorted array commands of a rich data structure server.
    Rds,
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rds" => Ok(Self::Rds),
            _ => Err(ConfigError::UnknownProtocol(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Create,
    Delete,
    Find,
    Get,
    Insert,
    Len,
    Remove,
    Truncate,
}

impl Action {
    pub const ALL: [Action; 8] = [
        Action::Create,
        Action::Delete,
        Action::Find,
        Action::Get,
        Action::Insert,
        Action::Len,
        Action::Remove,
        Action::Truncate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Delete => "delete",
            Action::Find => "find",
            Action::Get => "get",
            Action::Insert => "insert",
            Action::Len => "len",
            Action::Remove => "remove",
            Action::Truncate => "truncate",
        }
    }

    /// Dense index, used to address per-action counters.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn needs_value(self) -> bool {
        matches!(
            self,
            Action::Create | Action::Find | Action::Insert | Action::Remove
        )
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        let name = name.strip_prefix("sarray_").unwrap_or(&name);
        Action::ALL
            .into_iter()
            .find(|action| action.as_str() == name)
            .ok_or_else(|| s.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueClass {
    Bytes,
    /// little-endian unsigned integer, 1..=8 bytes wide
    Integer,
}

impl FromStr for ValueClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bytes" | "raw" => Ok(Self::Bytes),
            "integer" | "u64" => Ok(Self::Integer),
            _ => Err(s.to_owned()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub low: u64,
    pub high: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub action: Action,
    pub watermarks: Option<Watermarks>,
    pub items: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueSpec {
    pub length: usize,
    pub class: ValueClass,
}

/// Byte alphabet keys are rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlphabet {
    /// `0-9A-Za-z`, used whenever every keyspace fits in it
    Printable,
    /// all 256 byte values, for short keys over large keyspaces
    Binary,
}

impl KeyAlphabet {
    pub const fn radix(self) -> u128 {
        match self {
            Self::Printable => 62,
            Self::Binary => 256,
        }
    }

    /// Whether `length` digits can render `keys` distinct values.
    fn holds(self, length: usize, keys: u128) -> bool {
        u32::try_from(length)
            .ok()
            .and_then(|exp| self.radix().checked_pow(exp))
            .is_none_or(|capacity| keys <= capacity)
    }
}

/// Largest key count of a keyspace whose structures are tracked; the
/// lifecycle state keeps a few bytes per key.
pub const MAX_TRACKED_KEYS: u64 = 1 << 27;

#[derive(Debug, Clone, PartialEq)]
pub struct Keyspace {
    /// position among the configured keyspaces
    pub ordinal: usize,
    /// number of configured keyspaces, keys are interleaved across them
    pub stride: usize,
    pub length: usize,
    pub alphabet: KeyAlphabet,
    pub count: u64,
    pub weight: f64,
    pub commands: WeightedTable<Command>,
    pub values: Option<WeightedTable<ValueSpec>>,
    /// bounds on the number of existing structures, `[0, count]` if unset
    pub watermarks: Watermarks,
}

impl Keyspace {
    /// Whether create or delete can be drawn, so structure lifecycle matters.
    pub fn tracks_lifecycle(&self) -> bool {
        self.commands
            .items()
            .iter()
            .enumerate()
            .any(|(index, command)| {
                matches!(command.action, Action::Create | Action::Delete)
                    && self.commands.probability(index) > 0.0
            })
    }

    /// Element size announced on create: the first configured value length.
    pub fn element_size(&self) -> usize {
        self.values
            .as_ref()
            .and_then(|values| values.get(0))
            .map(|spec| spec.length)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct General {
    pub protocol: Protocol,
    pub interval: Duration,
    pub windows: u64,
    pub clients: usize,
    pub poolsize: usize,
    pub tcp_nodelay: bool,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub seed: Option<u64>,
}

impl General {
    /// Total run length: `windows * interval`.
    pub fn duration(&self) -> Duration {
        self.interval
            .saturating_mul(u32::try_from(self.windows).unwrap_or(u32::MAX))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    general: General,
    endpoints: Vec<String>,
    keyspaces: WeightedTable<Keyspace>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&raw)?;
        tracing::info!(
            path = %path.display(),
            keyspaces = config.keyspaces.len(),
            "configuration loaded",
        );
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(raw).map_err(ConfigError::Parse)?;
        Self::try_from_file(file)
    }

    pub fn try_from_file(file: ConfigFile) -> Result<Self, ConfigError> {
        let general = validate_general(&file.general)?;

        let mut endpoints = Vec::with_capacity(file.target.endpoints.len());
        for endpoint in file.target.endpoints {
            endpoints.push(validate_endpoint(endpoint)?);
        }

        if file.keyspaces.is_empty() {
            return Err(ConfigError::NoKeyspaces);
        }
        let stride = file.keyspaces.len();
        let mut keyspaces = Vec::with_capacity(stride);
        for (ordinal, keyspace) in file.keyspaces.iter().enumerate() {
            let keyspace = validate_keyspace(ordinal, stride, keyspace)?;
            let weight = keyspace.weight;
            keyspaces.push((keyspace, weight));
        }

        // one alphabet for the whole run keeps keys of equal length distinct
        // across keyspaces
        let printable = keyspaces.iter().all(|(keyspace, _)| {
            KeyAlphabet::Printable.holds(keyspace.length, key_slots(keyspace.count, stride))
        });
        if !printable {
            tracing::info!("key lengths too short for printable keys: rendering binary keys");
            for (keyspace, _) in &mut keyspaces {
                keyspace.alphabet = KeyAlphabet::Binary;
            }
        }
        let keyspaces =
            WeightedTable::try_new(keyspaces).map_err(|source| ConfigError::Weights {
                context: "keyspaces".to_owned(),
                source,
            })?;

        Ok(Self {
            general,
            endpoints,
            keyspaces,
        })
    }

    /// Appends endpoints given outside of the file (e.g. on the command line).
    pub fn with_endpoints(
        mut self,
        endpoints: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        for endpoint in endpoints {
            let endpoint = validate_endpoint(endpoint)?;
            if !self.endpoints.contains(&endpoint) {
                self.endpoints.push(endpoint);
            }
        }
        Ok(self)
    }

    pub fn general(&self) -> &General {
        &self.general
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn keyspaces(&self) -> &WeightedTable<Keyspace> {
        &self.keyspaces
    }
}

fn validate_general(general: &GeneralFile) -> Result<General, ConfigError> {
    fn positive(field: &'static str, value: u64) -> Result<u64, ConfigError> {
        if value == 0 {
            return Err(ConfigError::InvalidField {
                field,
                reason: "must be greater than zero".to_owned(),
            });
        }
        Ok(value)
    }

    fn to_usize(field: &'static str, value: u64) -> Result<usize, ConfigError> {
        usize::try_from(value).map_err(|_| ConfigError::InvalidField {
            field,
            reason: format!("{value} does not fit in the address space"),
        })
    }

    Ok(General {
        protocol: general.protocol.parse()?,
        interval: Duration::from_secs(positive("general.interval", general.interval)?),
        windows: positive("general.windows", general.windows)?,
        clients: to_usize(
            "general.clients",
            positive("general.clients", general.clients)?,
        )?,
        poolsize: to_usize(
            "general.poolsize",
            positive("general.poolsize", general.poolsize)?,
        )?,
        tcp_nodelay: general.tcp_nodelay,
        request_timeout: Duration::from_micros(positive(
            "general.request_timeout",
            general.request_timeout,
        )?),
        connect_timeout: Duration::from_micros(positive(
            "general.connect_timeout",
            general.connect_timeout,
        )?),
        seed: general.seed,
    })
}

fn validate_endpoint(endpoint: String) -> Result<String, ConfigError> {
    let valid = endpoint
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
    if !valid {
        return Err(ConfigError::InvalidEndpoint(endpoint));
    }
    Ok(endpoint)
}

fn validate_keyspace(
    ordinal: usize,
    stride: usize,
    keyspace: &KeyspaceFile,
) -> Result<Keyspace, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidKeyspace {
        keyspace: ordinal,
        reason,
    };

    if keyspace.length == 0 {
        return Err(invalid("key length must be greater than zero".to_owned()));
    }
    if keyspace.count == 0 {
        return Err(invalid("key count must be greater than zero".to_owned()));
    }
    let length = usize::try_from(keyspace.length)
        .map_err(|_| invalid(format!("key length {} is too large", keyspace.length)))?;

    // every (keyspace, index) pair renders to a distinct key
    if !KeyAlphabet::Binary.holds(length, key_slots(keyspace.count, stride)) {
        return Err(invalid(format!(
            "key length {length} cannot hold {} distinct keys",
            keyspace.count
        )));
    }

    if keyspace.commands.is_empty() {
        return Err(invalid("command list is empty".to_owned()));
    }

    let mut commands = Vec::with_capacity(keyspace.commands.len());
    let mut watermarks = None;
    for command in &keyspace.commands {
        let action: Action =
            command
                .action
                .parse()
                .map_err(|action| ConfigError::UnknownAction {
                    keyspace: ordinal,
                    action,
                })?;

        let items = match command.items {
            None => 1,
            Some(0) => return Err(invalid(format!("{action}: items must be at least 1"))),
            Some(items) => u32::try_from(items)
                .map_err(|_| invalid(format!("{action}: items {items} is too large")))?,
        };

        let command_watermarks = match (command.watermark_low, command.watermark_high) {
            (None, None) => None,
            (low, high) if matches!(action, Action::Create | Action::Delete) => {
                let low = low.unwrap_or(0);
                let high = high.unwrap_or_else(|| keyspace.count.max(low));
                if low > high {
                    return Err(ConfigError::InvertedWatermarks {
                        keyspace: ordinal,
                        low,
                        high,
                    });
                }
                let marks = Watermarks { low, high };
                // a create/delete pair shares one set of bounds
                if let Some(other) = watermarks.filter(|other| *other != marks) {
                    return Err(ConfigError::ConflictingWatermarks {
                        keyspace: ordinal,
                        first: other,
                        second: marks,
                    });
                }
                watermarks = Some(marks);
                Some(marks)
            }
            _ => {
                return Err(invalid(format!(
                    "{action}: watermarks only apply to create and delete"
                )));
            }
        };

        commands.push((
            Command {
                action,
                watermarks: command_watermarks,
                items,
            },
            command.weight,
        ));
    }

    let needs_values = commands
        .iter()
        .any(|(command, weight)| *weight > 0.0 && command.action.needs_value());

    let commands = WeightedTable::try_new(commands).map_err(|source| ConfigError::Weights {
        context: format!("keyspace #{ordinal} commands"),
        source,
    })?;

    let values = if keyspace.values.is_empty() {
        if needs_values {
            return Err(invalid(
                "value producing commands require at least one value".to_owned(),
            ));
        }
        None
    } else {
        let mut values = Vec::with_capacity(keyspace.values.len());
        for value in &keyspace.values {
            let class: ValueClass =
                value
                    .class
                    .parse()
                    .map_err(|class| ConfigError::UnknownValueClass {
                        keyspace: ordinal,
                        class,
                    })?;
            let length = usize::try_from(value.length)
                .ok()
                .filter(|length| *length > 0)
                .ok_or_else(|| invalid(format!("value length {} is invalid", value.length)))?;
            if class == ValueClass::Integer && length > 8 {
                return Err(invalid(format!(
                    "integer values are at most 8 bytes, got {length}"
                )));
            }
            values.push((ValueSpec { length, class }, value.weight));
        }
        Some(
            WeightedTable::try_new(values).map_err(|source| ConfigError::Weights {
                context: format!("keyspace #{ordinal} values"),
                source,
            })?,
        )
    };

    let keyspace = Keyspace {
        ordinal,
        stride,
        length,
        alphabet: KeyAlphabet::Printable,
        count: keyspace.count,
        weight: keyspace.weight,
        commands,
        values,
        watermarks: watermarks.unwrap_or(Watermarks {
            low: 0,
            high: keyspace.count,
        }),
    };

    if keyspace.tracks_lifecycle() && keyspace.count > MAX_TRACKED_KEYS {
        return Err(invalid(format!(
            "create/delete track at most {MAX_TRACKED_KEYS} keys, got {}",
            keyspace.count
        )));
    }

    Ok(keyspace)
}

fn key_slots(count: u64, stride: usize) -> u128 {
    count as u128 * stride as u128
}

/// Fatal, pre-run configuration problems.
#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    Parse(toml::de::Error),
    UnknownProtocol(String),
    InvalidField {
        field: &'static str,
        reason: String,
    },
    InvalidEndpoint(String),
    NoEndpoints,
    NoKeyspaces,
    InvalidKeyspace {
        keyspace: usize,
        reason: String,
    },
    UnknownAction {
        keyspace: usize,
        action: String,
    },
    UnknownValueClass {
        keyspace: usize,
        class: String,
    },
    InvertedWatermarks {
        keyspace: usize,
        low: u64,
        high: u64,
    },
    ConflictingWatermarks {
        keyspace: usize,
        first: Watermarks,
        second: Watermarks,
    },
    Weights {
        context: String,
        source: SelectionError,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "read config file '{path}': {source}"),
            Self::Parse(err) => write!(f, "parse config: {err}"),
            Self::UnknownProtocol(protocol) => write!(f, "unknown protocol '{protocol}'"),
            Self::InvalidField { field, reason } => write!(f, "{field}: {reason}"),
            Self::InvalidEndpoint(endpoint) => {
                write!(f, "invalid endpoint '{endpoint}': expected host:port")
            }
            Self::NoEndpoints => write!(f, "no endpoints configured"),
            Self::NoKeyspaces => write!(f, "no keyspaces configured"),
            Self::InvalidKeyspace { keyspace, reason } => {
                write!(f, "keyspace #{keyspace}: {reason}")
            }
            Self::UnknownAction { keyspace, action } => {
                write!(f, "keyspace #{keyspace}: unknown action '{action}'")
            }
            Self::UnknownValueClass { keyspace, class } => {
                write!(f, "keyspace #{keyspace}: unknown value class '{class}'")
            }
            Self::InvertedWatermarks {
                keyspace,
                low,
                high,
            } => write!(
                f,
                "keyspace #{keyspace}: watermark_low ({low}) exceeds watermark_high ({high})"
            ),
            Self::ConflictingWatermarks {
                keyspace,
                first,
                second,
            } => write!(
                f,
                "keyspace #{keyspace}: watermarks {}..={} conflict with {}..={}",
                second.low, second.high, first.low, first.high
            ),
            Self::Weights { context, source } => write!(f, "{context}: {source}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Weights { source, .. } => Some(source),
            _ => None,
        }
    }
}
