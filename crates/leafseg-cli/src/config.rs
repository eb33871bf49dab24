use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::Parser;
use leafseg::{
    FILE_STORE, HANDOFF_TIMEOUT_MILLIS, INITIAL_VALUE, KEY_NAME, LOCK_TIMEOUT_MILLIS, Properties,
    SEGMENT_STEP, SERVER_LIST, STORE_NAMESPACE, STORE_TYPE, SegmentConfig,
};

/// Command line options for the `leafseg` binary.
///
/// Every generator property can come from a flag, an environment variable or
/// a JSON properties file. Flags and variables win over the file; anything
/// left unset falls back to the library defaults, except `store.type` which
/// defaults to the file store here.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "leafseg",
    version,
    about = "Issue IDs from segment-based generators sharing one store"
)]
pub struct CliArgs {
    /// JSON object of string properties, e.g. `{"key.name": "t_order"}`.
    #[arg(long, env = "PROPERTIES_FILE")]
    pub properties: Option<PathBuf>,

    /// Logical key the IDs are issued for.
    ///
    /// Environment variable: `KEY_NAME`
    #[arg(long, env = "KEY_NAME")]
    pub key_name: Option<String>,

    /// IDs reserved per store round trip.
    ///
    /// Environment variable: `SEGMENT_STEP`
    #[arg(long, env = "SEGMENT_STEP")]
    pub step: Option<u64>,

    /// First ID issued when the store holds no boundary for the key.
    ///
    /// Environment variable: `ID_INITIAL_VALUE`
    #[arg(long, env = "ID_INITIAL_VALUE")]
    pub initial_value: Option<u64>,

    /// Comma separated store servers. For the file store, the first entry is
    /// the root directory.
    ///
    /// Environment variable: `SERVER_LIST`
    #[arg(long, env = "SERVER_LIST")]
    pub server_list: Option<String>,

    /// Store adapter: `file` or `memory`.
    ///
    /// Environment variable: `STORE_TYPE`
    #[arg(long, env = "STORE_TYPE")]
    pub store_type: Option<String>,

    /// Namespace the key lives under in the store.
    ///
    /// Environment variable: `STORE_NAMESPACE`
    #[arg(long, env = "STORE_NAMESPACE")]
    pub namespace: Option<String>,

    /// Give up acquiring the key lock after this many milliseconds.
    ///
    /// Environment variable: `LOCK_TIMEOUT_MILLIS`
    #[arg(long, env = "LOCK_TIMEOUT_MILLIS")]
    pub lock_timeout_millis: Option<u64>,

    /// Give up waiting for a prefetched segment after this many milliseconds.
    ///
    /// Environment variable: `HANDOFF_TIMEOUT_MILLIS`
    #[arg(long, env = "HANDOFF_TIMEOUT_MILLIS")]
    pub handoff_timeout_millis: Option<u64>,

    /// Number of IDs to print.
    ///
    /// Environment variable: `COUNT`
    #[arg(short = 'n', long, env = "COUNT", default_value_t = 10)]
    pub count: u64,

    /// Number of generator instances sharing the store. IDs are drawn from
    /// them round-robin.
    ///
    /// Environment variable: `INSTANCES`
    #[arg(short, long, env = "INSTANCES", default_value_t = 1)]
    pub instances: usize,

    /// Log per-instance counters after the run.
    #[arg(long, default_value_t = false)]
    pub stats: bool,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub segment: SegmentConfig,
    pub count: u64,
    pub instances: usize,
    pub stats: bool,
}

impl TryFrom<CliArgs> for RunConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.instances == 0 {
            bail!("INSTANCES must be greater than 0");
        }

        let mut properties = match &args.properties {
            Some(path) => load_properties(path)?,
            None => Properties::new(),
        };

        let overrides = [
            (KEY_NAME, args.key_name),
            (SEGMENT_STEP, args.step.map(|v| v.to_string())),
            (INITIAL_VALUE, args.initial_value.map(|v| v.to_string())),
            (SERVER_LIST, args.server_list),
            (STORE_TYPE, args.store_type),
            (STORE_NAMESPACE, args.namespace),
            (LOCK_TIMEOUT_MILLIS, args.lock_timeout_millis.map(|v| v.to_string())),
            (HANDOFF_TIMEOUT_MILLIS, args.handoff_timeout_millis.map(|v| v.to_string())),
        ];
        for (property, value) in overrides {
            if let Some(value) = value {
                properties.set(property, value);
            }
        }
        if properties.get(STORE_TYPE).is_none() {
            properties.set(STORE_TYPE, FILE_STORE);
        }

        let segment = SegmentConfig::from_properties(&properties)
            .context("invalid generator properties")?;

        Ok(Self {
            segment,
            count: args.count,
            instances: args.instances,
            stats: args.stats,
        })
    }
}

fn load_properties(path: &Path) -> anyhow::Result<Properties> {
    let file = File::open(path)
        .with_context(|| format!("failed to open properties file {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse properties file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use leafseg::{ConfigError, DEFAULT_NAMESPACE, MEMORY_STORE};
    use std::io::Write;

    fn args(extra: &[&str]) -> CliArgs {
        let base = ["leafseg", "--key-name", "t_order", "--server-list", "/tmp/ids"];
        CliArgs::parse_from(base.iter().chain(extra))
    }

    #[test]
    fn defaults_to_file_store() {
        let config = RunConfig::try_from(args(&[])).unwrap();
        assert_eq!(config.segment.store.store_type, FILE_STORE);
        assert_eq!(config.segment.store.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.count, 10);
        assert_eq!(config.instances, 1);
    }

    #[test]
    fn flags_override_properties_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"key.name": "from_file", "segment.step": "50", "store.type": "{MEMORY_STORE}"}}"#
        )
        .unwrap();
        let path = file.path().display().to_string();

        let config =
            RunConfig::try_from(args(&["--properties", &path, "--step", "7"])).unwrap();
        assert_eq!(config.segment.key.name(), "t_order");
        assert_eq!(config.segment.step, 7);
        assert_eq!(config.segment.store.store_type, MEMORY_STORE);
    }

    #[test]
    fn rejects_zero_instances() {
        assert!(RunConfig::try_from(args(&["--instances", "0"])).is_err());
    }

    #[test]
    fn surfaces_property_errors() {
        let err = RunConfig::try_from(args(&["--step", "0"])).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::StepOutOfRange(0))
        );
    }
}
