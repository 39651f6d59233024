//! Session configuration: the party list and runtime tunables.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};
use crate::frame::DEFAULT_MAX_PAYLOAD;

/// Port of party 0 when no port is given; party `i` uses `base + i`.
pub const DEFAULT_BASE_PORT: u16 = 11365;

/// Host and port of one party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyAddress {
    pub host: String,
    pub port: u16,
}

impl PartyAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PartyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Everything the runtime needs to join a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Identity of the local party; index into `parties`.
    pub local: u8,

    /// Delay between attempts to dial a peer that is not listening yet.
    #[serde(with = "duration_ms")]
    pub retry_interval: Duration,

    /// Upper bound on reaching the session barrier. `None` waits forever.
    #[serde(with = "opt_duration_ms", skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<Duration>,

    /// Upper bound used by `Runtime::evaluate`. `None` waits forever.
    #[serde(with = "opt_duration_ms", skip_serializing_if = "Option::is_none")]
    pub resolve_timeout: Option<Duration>,

    /// Largest payload accepted from a peer, in bytes.
    pub max_payload: u32,

    /// One address per party, in identity order.
    pub parties: Vec<PartyAddress>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local: 0,
            retry_interval: Duration::from_millis(100),
            connect_timeout: None,
            resolve_timeout: None,
            max_payload: DEFAULT_MAX_PAYLOAD,
            parties: vec![PartyAddress::new("localhost", DEFAULT_BASE_PORT)],
        }
    }
}

impl SessionConfig {
    /// Config for the given party list with default tunables.
    pub fn new(local: u8, parties: Vec<PartyAddress>) -> Self {
        Self {
            local,
            parties,
            ..Self::default()
        }
    }

    /// `m` parties on localhost at `base_port + i`.
    pub fn localhost(m: usize, local: u8, base_port: Option<u16>) -> Result<Self> {
        let base = base_port.unwrap_or(DEFAULT_BASE_PORT);
        let parties = (0..m)
            .map(|i| Ok(PartyAddress::new("localhost", offset_port(base, i)?)))
            .collect::<Result<Vec<_>>>()?;
        let config = Self::new(local, parties);
        config.validate()?;
        Ok(config)
    }

    /// Build a config from `host:port` entries, one per party.
    ///
    /// An entry with an empty host marks the local party (served on
    /// `localhost`). An entry with an empty port gets `11365 + i`; a
    /// `base_port` overrides every port with `base_port + i`. If no entry
    /// is marked local, `index` decides.
    pub fn from_party_list(
        entries: &[String],
        base_port: Option<u16>,
        index: Option<u8>,
    ) -> Result<Self> {
        let mut marked = None;
        let mut parties = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let (host, port) = entry.rsplit_once(':').unwrap_or((entry.as_str(), ""));
            let host = if host.is_empty() {
                marked = Some(i);
                "localhost"
            } else {
                host
            };
            let port = match base_port {
                Some(base) => offset_port(base, i)?,
                None if port.is_empty() => offset_port(DEFAULT_BASE_PORT, i)?,
                None => port.parse().map_err(|e| {
                    RuntimeError::Config(format!("bad port in party address '{entry}': {e}"))
                })?,
            };
            parties.push(PartyAddress::new(host, port));
        }

        let local = match (marked, index) {
            (Some(i), _) => u8::try_from(i)
                .map_err(|_| RuntimeError::Config(format!("party index {i} out of range")))?,
            (None, Some(index)) => index,
            (None, None) => {
                return Err(RuntimeError::Config(
                    "no local party: mark one address with an empty host or give an index".into(),
                ));
            }
        };
        let config = Self::new(local, parties);
        config.validate()?;
        Ok(config)
    }

    /// Check party count and local identity.
    pub fn validate(&self) -> Result<()> {
        let m = self.parties.len();
        if m == 0 || m > 256 {
            return Err(RuntimeError::Config(format!("expected 1..=256 parties, got {m}")));
        }
        if usize::from(self.local) >= m {
            return Err(RuntimeError::Config(format!(
                "local party {} out of range for {m} parties",
                self.local
            )));
        }
        Ok(())
    }

    /// Address of the local party.
    pub fn local_address(&self) -> Option<&PartyAddress> {
        self.parties.get(usize::from(self.local))
    }

    /// Save the config to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self)
            .map_err(|e| RuntimeError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text).map_err(|e| {
            RuntimeError::Config(format!("invalid config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }
}

fn offset_port(base: u16, i: usize) -> Result<u16> {
    u16::try_from(i)
        .ok()
        .and_then(|i| base.checked_add(i))
        .ok_or_else(|| RuntimeError::Config(format!("port {base} + {i} out of range")))
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match dur {
            Some(dur) => s.serialize_some(&(dur.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.local, 0);
        assert_eq!(config.retry_interval, Duration::from_millis(100));
        assert!(config.connect_timeout.is_none());
        assert!(config.resolve_timeout.is_none());
        assert_eq!(config.max_payload, DEFAULT_MAX_PAYLOAD);
        assert_eq!(config.parties.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_localhost_ports() {
        let config = SessionConfig::localhost(3, 1, None).unwrap();
        let ports: Vec<u16> = config.parties.iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![11365, 11366, 11367]);
        assert_eq!(config.local_address().unwrap().port, 11366);

        let config = SessionConfig::localhost(2, 0, Some(9000)).unwrap();
        assert_eq!(config.parties[1], PartyAddress::new("localhost", 9001));

        assert!(SessionConfig::localhost(2, 2, None).is_err());
        assert!(SessionConfig::localhost(2, 0, Some(u16::MAX)).is_err());
    }

    #[test]
    fn test_party_list_marks_local_with_empty_host() {
        let config =
            SessionConfig::from_party_list(&entries(&["10.0.0.1:7000", ":7001", "10.0.0.3:"]), None, None)
                .unwrap();
        assert_eq!(config.local, 1);
        assert_eq!(config.parties[0], PartyAddress::new("10.0.0.1", 7000));
        assert_eq!(config.parties[1], PartyAddress::new("localhost", 7001));
        assert_eq!(config.parties[2], PartyAddress::new("10.0.0.3", 11367));
    }

    #[test]
    fn test_party_list_base_port_and_index() {
        let config =
            SessionConfig::from_party_list(&entries(&["a:1", "b:2"]), Some(5000), Some(1)).unwrap();
        assert_eq!(config.local, 1);
        assert_eq!(config.parties[0].port, 5000);
        assert_eq!(config.parties[1].port, 5001);
    }

    #[test]
    fn test_party_list_errors() {
        assert!(SessionConfig::from_party_list(&entries(&["a:1", "b:2"]), None, None).is_err());
        assert!(SessionConfig::from_party_list(&entries(&["a:x"]), None, Some(0)).is_err());
        assert!(SessionConfig::from_party_list(&entries(&["a:1"]), None, Some(1)).is_err());
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parties.toml");

        let mut saved = SessionConfig::localhost(3, 2, Some(12000)).unwrap();
        saved.resolve_timeout = Some(Duration::from_secs(5));
        saved.save(&path).unwrap();

        let loaded = SessionConfig::load(&path).unwrap();
        assert_eq!(loaded.local, 2);
        assert_eq!(loaded.parties, saved.parties);
        assert_eq!(loaded.resolve_timeout, Some(Duration::from_secs(5)));
        assert!(loaded.connect_timeout.is_none());
        assert_eq!(loaded.retry_interval, saved.retry_interval);
    }

    #[test]
    fn test_config_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parties.toml");
        std::fs::write(
            &path,
            "local = 1\n\n[[parties]]\nhost = \"alpha\"\nport = 9000\n\n[[parties]]\nhost = \"beta\"\nport = 9001\n",
        )
        .unwrap();

        let loaded = SessionConfig::load(&path).unwrap();
        assert_eq!(loaded.local, 1);
        assert_eq!(loaded.parties.len(), 2);
        assert_eq!(loaded.retry_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_config_load_rejects_bad_local() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parties.toml");
        std::fs::write(&path, "local = 4\n\n[[parties]]\nhost = \"alpha\"\nport = 9000\n").unwrap();
        assert!(matches!(
            SessionConfig::load(&path),
            Err(RuntimeError::Config(_))
        ));
    }
}
