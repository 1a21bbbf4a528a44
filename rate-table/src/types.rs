use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

const KEY_SEPARATOR: char = '#';

/// Reserved key holding the [`TableManifest`] in both backends.
pub const MANIFEST_KEY: &str = "__manifest__";

#[derive(thiserror::Error, Debug)]
pub enum EntryError {
    #[error("malformed entry {key}: {reason}")]
    Malformed { key: String, reason: String },
    #[error("invalid entry key: {0}")]
    InvalidKey(String),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AddressFamily::Ipv4 => "ipv4",
            AddressFamily::Ipv6 => "ipv6",
        }
    }
}

impl FromStr for AddressFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ipv4" => Ok(AddressFamily::Ipv4),
            "ipv6" => Ok(AddressFamily::Ipv6),
            other => Err(format!("unknown address family '{other}'")),
        }
    }
}

/// Identity of a rate table row: `(requester_ip, path, policy, target_ip)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    pub requester_ip: String,
    pub path: String,
    pub policy: String,
    pub target_ip: String,
}

impl EntryKey {
    pub fn new<R, P, O, T>(requester_ip: R, path: P, policy: O, target_ip: T) -> Self
    where
        R: Into<String>,
        P: Into<String>,
        O: Into<String>,
        T: Into<String>,
    {
        EntryKey {
            requester_ip: requester_ip.into(),
            path: path.into(),
            policy: policy.into(),
            target_ip: target_ip.into(),
        }
    }

    fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("requester_ip", &self.requester_ip),
            ("path", &self.path),
            ("policy", &self.policy),
            ("target_ip", &self.target_ip),
        ] {
            if value.contains(KEY_SEPARATOR) {
                return Err(format!("{name} contains '{KEY_SEPARATOR}'"));
            }
        }
        if self.path.is_empty() {
            return Err("path is empty".into());
        }
        if self.target_ip.is_empty() {
            return Err("target_ip is empty".into());
        }
        Ok(())
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}",
            self.requester_ip, self.path, self.policy, self.target_ip
        )
    }
}

impl FromStr for EntryKey {
    type Err = EntryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(KEY_SEPARATOR).collect();
        let [requester_ip, path, policy, target_ip] = parts.as_slice() else {
            return Err(EntryError::InvalidKey(s.to_string()));
        };
        let key = EntryKey::new(*requester_ip, *path, *policy, *target_ip);
        key.validate().map_err(|_| EntryError::InvalidKey(s.to_string()))?;
        Ok(key)
    }
}

/// A row as produced by the analytical query. Coordinates arrive as strings
/// and may be empty.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    #[serde(default)]
    pub af: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub latitude: String,
    #[serde(default)]
    pub longitude: String,
    #[serde(default)]
    pub metro: String,
    #[serde(default)]
    pub policy: String,
    pub path: String,
    pub probability: f64,
    #[serde(default)]
    pub requester_ip: String,
    pub requests_per_day: i64,
    pub target_ip: String,
}

/// One validated row of the rate table. Equality and hashing only consider
/// the [`EntryKey`]; use [`RateEntry::same_content`] to compare attributes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "RawRow", into = "RawRow")]
pub struct RateEntry {
    key: EntryKey,
    af: Option<AddressFamily>,
    format: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    metro: String,
    probability: f64,
    requests_per_day: u64,
}

impl RateEntry {
    pub fn key(&self) -> &EntryKey {
        &self.key
    }

    pub fn path(&self) -> &str {
        &self.key.path
    }

    pub fn policy(&self) -> &str {
        &self.key.policy
    }

    pub fn target_ip(&self) -> &str {
        &self.key.target_ip
    }

    pub fn requester_ip(&self) -> &str {
        &self.key.requester_ip
    }

    pub fn af(&self) -> Option<AddressFamily> {
        self.af
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    /// `(latitude, longitude)` when both are known.
    pub fn location(&self) -> Option<(f64, f64)> {
        self.latitude.zip(self.longitude)
    }

    pub fn metro(&self) -> &str {
        &self.metro
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    pub fn requests_per_day(&self) -> u64 {
        self.requests_per_day
    }

    pub fn same_content(&self, other: &RateEntry) -> bool {
        self.key == other.key
            && self.af == other.af
            && self.format == other.format
            && self.latitude == other.latitude
            && self.longitude == other.longitude
            && self.metro == other.metro
            && self.probability == other.probability
            && self.requests_per_day == other.requests_per_day
    }

    /// Whether this entry's requester pattern covers `client_ip`.
    /// Empty and `*` patterns match everything, a trailing `*` matches by prefix.
    pub fn matches_requester(&self, client_ip: Option<&str>) -> bool {
        let pattern = self.key.requester_ip.as_str();
        if pattern.is_empty() || pattern == "*" {
            return true;
        }
        let Some(ip) = client_ip else {
            return false;
        };
        match pattern.strip_suffix('*') {
            Some(prefix) => ip.starts_with(prefix),
            None => ip == pattern,
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, EntryError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, EntryError> {
        Ok(serde_json::from_slice(data)?)
    }
}

impl PartialEq for RateEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for RateEntry {}

impl Hash for RateEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

fn parse_coordinate(key: &EntryKey, name: &str, value: &str) -> Result<Option<f64>, EntryError> {
    if value.is_empty() {
        return Ok(None);
    }
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(EntryError::Malformed {
            key: key.to_string(),
            reason: format!("{name} '{value}' is not a coordinate"),
        }),
    }
}

impl TryFrom<RawRow> for RateEntry {
    type Error = EntryError;

    fn try_from(row: RawRow) -> Result<Self, Self::Error> {
        let key = EntryKey::new(row.requester_ip, row.path, row.policy, row.target_ip);
        let malformed = |reason: String| EntryError::Malformed {
            key: key.to_string(),
            reason,
        };

        key.validate().map_err(malformed)?;

        if !(0.0..=1.0).contains(&row.probability) {
            return Err(malformed(format!(
                "probability {} outside [0, 1]",
                row.probability
            )));
        }
        let requests_per_day = u64::try_from(row.requests_per_day).map_err(|_| {
            malformed(format!(
                "requests_per_day {} is negative",
                row.requests_per_day
            ))
        })?;
        let af = match row.af.as_str() {
            "" => None,
            af => Some(af.parse::<AddressFamily>().map_err(malformed)?),
        };
        let latitude = parse_coordinate(&key, "latitude", &row.latitude)?;
        let longitude = parse_coordinate(&key, "longitude", &row.longitude)?;

        Ok(RateEntry {
            key,
            af,
            format: row.format,
            latitude,
            longitude,
            metro: row.metro,
            probability: row.probability,
            requests_per_day,
        })
    }
}

impl From<RateEntry> for RawRow {
    fn from(entry: RateEntry) -> Self {
        let coordinate = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
        RawRow {
            af: entry.af.map(|af| af.as_str().to_string()).unwrap_or_default(),
            format: entry.format,
            latitude: coordinate(entry.latitude),
            longitude: coordinate(entry.longitude),
            metro: entry.metro,
            policy: entry.key.policy,
            path: entry.key.path,
            probability: entry.probability,
            requester_ip: entry.key.requester_ip,
            requests_per_day: i64::try_from(entry.requests_per_day).unwrap_or(i64::MAX),
            target_ip: entry.key.target_ip,
        }
    }
}

/// The full set of entries produced by one synchronization cycle.
#[derive(Clone, Debug, Default)]
pub struct TableSnapshot {
    entries: HashMap<EntryKey, RateEntry>,
}

impl TableSnapshot {
    /// Converts raw rows, rejecting malformed ones individually. On duplicate
    /// keys the last row wins.
    pub fn from_rows(rows: Vec<RawRow>) -> (Self, Vec<EntryError>) {
        let mut snapshot = TableSnapshot::default();
        let mut rejected = Vec::new();

        for row in rows {
            match RateEntry::try_from(row) {
                Ok(entry) => {
                    if let Some(previous) = snapshot.entries.insert(entry.key.clone(), entry) {
                        tracing::warn!(key = %previous.key, "duplicate key in analytics result");
                    }
                }
                Err(err) => rejected.push(err),
            }
        }

        (snapshot, rejected)
    }

    pub fn get(&self, key: &EntryKey) -> Option<&RateEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &EntryKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &EntryKey> {
        self.entries.keys()
    }

    pub fn entries(&self) -> impl Iterator<Item = &RateEntry> {
        self.entries.values()
    }
}

impl FromIterator<RateEntry> for TableSnapshot {
    fn from_iter<I: IntoIterator<Item = RateEntry>>(iter: I) -> Self {
        TableSnapshot {
            entries: iter.into_iter().map(|e| (e.key.clone(), e)).collect(),
        }
    }
}

/// Key list of the currently published snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableManifest {
    pub cycle: u64,
    // seconds since 1970-01-01 00:00:00 UTC
    pub published_at: u64,
    pub keys: Vec<String>,
}

impl TableManifest {
    pub fn to_bytes(&self) -> Result<Bytes, EntryError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, EntryError> {
        Ok(serde_json::from_slice(data)?)
    }
}
