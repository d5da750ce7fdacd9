//! Daemon configuration from `SPINCYCLE_*` environment variables.
//!
//! Unset variables fall back to defaults; a variable that is set but does not
//! parse is a startup error rather than a silent default.

use std::path::PathBuf;
use std::str::FromStr;

use chrono_tz::Tz;

use crate::clock::Facility;
use crate::engine::{EngineConfig, QuotaMode, DEFAULT_MAX_PER_CATEGORY};
use crate::limits::{MAX_MACHINES, MAX_NAME_LEN};
use crate::model::Category;
use crate::notify::DEFAULT_CHANNEL_CAPACITY;

const PREFIX: &str = "SPINCYCLE_";

pub const DEFAULT_MACHINES: &str = "Washer 1:washer,Washer 2:washer,Dryer 1:dryer,Dryer 2:dryer";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
    #[error("operating hours {open}-{close} with {slot}h slots do not form a slot grid")]
    Hours { open: u32, close: u32, slot: u32 },
    #[error("machine list: {0}")]
    Machines(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSeed {
    pub name: String,
    pub category: Category,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    /// Admin sessions are disabled when unset.
    pub admin_password: Option<String>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub event_buffer: usize,
    pub engine: EngineConfig,
    pub machines: Vec<MachineSeed>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Keys are the full variable names.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup };

        let facility = Facility {
            tz: env.parsed("TIMEZONE", chrono_tz::Europe::Berlin, |s| Tz::from_str(s).map_err(|e| e.to_string()))?,
            open_hour: env.number("OPEN_HOUR", 8)?,
            close_hour: env.number("CLOSE_HOUR", 22)?,
            slot_hours: env.number("SLOT_HOURS", 1)?,
        };
        check_hours(&facility)?;

        let max_per_category = env.number("MAX_PER_CATEGORY", DEFAULT_MAX_PER_CATEGORY)?;
        let quota_mode = env.parsed("QUOTA_MODE", QuotaMode::default(), QuotaMode::from_str)?;

        let machines = match env.raw("MACHINES") {
            Some(list) => parse_machines(&list)?,
            None => parse_machines(DEFAULT_MACHINES)?,
        };

        Ok(Config {
            bind: env.raw("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: env.number("PORT", 7420)?,
            data_dir: env.raw("DATA_DIR").map_or_else(|| PathBuf::from("./data"), PathBuf::from),
            password: env.raw("PASSWORD").unwrap_or_else(|| "spincycle".into()),
            admin_password: env.raw("ADMIN_PASSWORD").filter(|p| !p.is_empty()),
            max_connections: env.number("MAX_CONNECTIONS", 256)?,
            compact_threshold: env.number("COMPACT_THRESHOLD", 1000)?,
            metrics_port: env.optional_number("METRICS_PORT")?,
            event_buffer: env.number("EVENT_BUFFER", DEFAULT_CHANNEL_CAPACITY)?,
            engine: EngineConfig {
                facility,
                max_per_category,
                quota_mode,
            },
            machines,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservations.wal")
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{PREFIX}{name}"))
    }

    fn parsed<T, E: ToString>(
        &self,
        name: &str,
        default: T,
        parse: impl Fn(&str) -> Result<T, E>,
    ) -> Result<T, ConfigError> {
        match self.raw(name) {
            None => Ok(default),
            Some(value) => parse(value.trim()).map_err(|e| ConfigError::Invalid {
                var: format!("{PREFIX}{name}"),
                value,
                reason: e.to_string(),
            }),
        }
    }

    fn number<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: ToString,
    {
        self.parsed(name, default, str::parse)
    }

    fn optional_number<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: ToString,
    {
        self.parsed(name, None, |s| s.parse().map(Some))
    }
}

fn check_hours(f: &Facility) -> Result<(), ConfigError> {
    let ok = f.slot_hours > 0
        && f.open_hour < f.close_hour
        && f.close_hour <= 24
        && (f.close_hour - f.open_hour) % f.slot_hours == 0;
    if ok {
        Ok(())
    } else {
        Err(ConfigError::Hours {
            open: f.open_hour,
            close: f.close_hour,
            slot: f.slot_hours,
        })
    }
}

/// `name:category` pairs separated by commas.
pub fn parse_machines(list: &str) -> Result<Vec<MachineSeed>, ConfigError> {
    let mut seeds: Vec<MachineSeed> = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, category) = entry
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::Machines(format!("{entry:?} is not name:category")))?;
        let name = name.trim();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(ConfigError::Machines(format!("bad machine name in {entry:?}")));
        }
        let category: Category = category.trim().parse().map_err(ConfigError::Machines)?;
        if seeds.iter().any(|s| s.name == name) {
            return Err(ConfigError::Machines(format!("duplicate machine {name:?}")));
        }
        seeds.push(MachineSeed {
            name: name.to_string(),
            category,
        });
    }
    if seeds.len() > MAX_MACHINES {
        return Err(ConfigError::Machines(format!("more than {MAX_MACHINES} machines")));
    }
    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[]).unwrap();
        assert_eq!(c.addr(), "0.0.0.0:7420");
        assert_eq!(c.wal_path(), PathBuf::from("./data/reservations.wal"));
        assert_eq!(c.password, "spincycle");
        assert_eq!(c.admin_password, None);
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.compact_threshold, 1000);
        assert_eq!(c.metrics_port, None);
        assert_eq!(c.engine, EngineConfig::default());
        assert_eq!(c.machines.len(), 4);
        assert_eq!(c.machines[2].name, "Dryer 1");
        assert_eq!(c.machines[2].category, Category::Dryer);
    }

    #[test]
    fn overrides() {
        let c = config(&[
            ("SPINCYCLE_PORT", "9000"),
            ("SPINCYCLE_METRICS_PORT", "9100"),
            ("SPINCYCLE_TIMEZONE", "America/New_York"),
            ("SPINCYCLE_OPEN_HOUR", "6"),
            ("SPINCYCLE_CLOSE_HOUR", "24"),
            ("SPINCYCLE_SLOT_HOURS", "2"),
            ("SPINCYCLE_QUOTA_MODE", "atomic"),
            ("SPINCYCLE_MAX_PER_CATEGORY", "3"),
            ("SPINCYCLE_ADMIN_PASSWORD", "root"),
            ("SPINCYCLE_MACHINES", "Big:washer"),
        ])
        .unwrap();
        assert_eq!(c.port, 9000);
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.engine.facility.tz, chrono_tz::America::New_York);
        assert_eq!(c.engine.facility.slot_ms(), 7_200_000);
        assert_eq!(c.engine.quota_mode, QuotaMode::Atomic);
        assert_eq!(c.engine.max_per_category, 3);
        assert_eq!(c.admin_password.as_deref(), Some("root"));
        assert_eq!(
            c.machines,
            vec![MachineSeed {
                name: "Big".into(),
                category: Category::Washer
            }]
        );
    }

    #[test]
    fn invalid_values_are_errors() {
        let err = config(&[("SPINCYCLE_PORT", "seventy")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, .. } if var == "SPINCYCLE_PORT"));
        assert!(config(&[("SPINCYCLE_TIMEZONE", "Mars/Olympus")]).is_err());
        assert!(config(&[("SPINCYCLE_QUOTA_MODE", "strict")]).is_err());
    }

    #[test]
    fn hours_must_form_a_grid() {
        assert!(matches!(config(&[("SPINCYCLE_OPEN_HOUR", "22")]), Err(ConfigError::Hours { .. })));
        assert!(config(&[("SPINCYCLE_CLOSE_HOUR", "25")]).is_err());
        assert!(config(&[("SPINCYCLE_SLOT_HOURS", "3")]).is_err()); // 14h window
        assert!(config(&[("SPINCYCLE_SLOT_HOURS", "0")]).is_err());
    }

    #[test]
    fn machine_list_parsing() {
        let seeds = parse_machines(" A:washer , B:DRYER,").unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[1].category, Category::Dryer);
        assert!(parse_machines("A").is_err());
        assert!(parse_machines("A:ironing").is_err());
        assert!(parse_machines("A:washer,A:dryer").is_err());
        assert!(parse_machines(":washer").is_err());
        assert!(parse_machines("").unwrap().is_empty());
    }
}
