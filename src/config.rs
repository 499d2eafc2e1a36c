use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointSettings, CheckpointStrategy, SmartPolicyConfig};

pub const ENV_PREFIX: &str = "SESSION_TIMELINE_";
pub const DEFAULT_LISTEN: &str = "127.0.0.1:7272";
pub const DEFAULT_QUIESCENCE_MS: u64 = 500;
pub const DEFAULT_KEEP_COUNT: usize = 10;

/// One configuration layer. Unset fields fall through to the next layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ConsoleConfig {
    pub database_url: Option<String>,
    pub listen: Option<String>,
    pub metrics_listen: Option<String>,
    pub quiescence_ms: Option<u64>,
    pub checkpoint_keep_count: Option<usize>,
    pub auto_checkpoint_enabled: Option<bool>,
    pub checkpoint_strategy: Option<CheckpointStrategy>,
    pub smart_policy: Option<SmartPolicyConfig>,
}

impl ConsoleConfig {
    pub fn load_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `lookup` receives full variable names, e.g. `SESSION_TIMELINE_LISTEN`. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty());
        let parsed = |name: &str| -> anyhow::Result<Option<u64>> {
            var(name).map(|v| v.trim().parse::<u64>().with_context(|| format!("{ENV_PREFIX}{name}={v:?}"))).transpose()
        };
        let auto_checkpoint_enabled = var("AUTO_CHECKPOINT")
            .map(|v| match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                other => anyhow::bail!("{ENV_PREFIX}AUTO_CHECKPOINT={other:?} is not a boolean"),
            })
            .transpose()?;
        let checkpoint_strategy = var("CHECKPOINT_STRATEGY")
            .map(|v| {
                serde_json::from_value(serde_json::Value::String(v.trim().to_owned()))
                    .with_context(|| format!("{ENV_PREFIX}CHECKPOINT_STRATEGY={v:?}"))
            })
            .transpose()?;
        Ok(Self {
            database_url: var("DATABASE_URL"),
            listen: var("LISTEN"),
            metrics_listen: var("METRICS_LISTEN"),
            quiescence_ms: parsed("QUIESCENCE_MS")?,
            checkpoint_keep_count: parsed("KEEP_COUNT")?.map(|n| n as usize),
            auto_checkpoint_enabled,
            checkpoint_strategy,
            smart_policy: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    /// `None` means the per-user default location.
    pub database_url: Option<String>,
    pub listen: SocketAddr,
    pub metrics_listen: Option<SocketAddr>,
    pub quiescence_delay: Duration,
    pub checkpoint_keep_count: usize,
    pub default_checkpoint: CheckpointSettings,
    pub smart_policy: SmartPolicyConfig,
}

/// Field-by-field precedence: cli over env over file over built-in defaults.
pub fn resolve_effective_config(
    file: &ConsoleConfig,
    env: &ConsoleConfig,
    cli: &ConsoleConfig,
) -> anyhow::Result<EffectiveConfig> {
    let layers = [cli, env, file];
    macro_rules! pick {
        ($field:ident) => {
            layers.iter().find_map(|l| l.$field.clone())
        };
    }

    let listen = pick!(listen).unwrap_or_else(|| DEFAULT_LISTEN.to_owned());
    let listen = listen.parse::<SocketAddr>().with_context(|| format!("listen address {listen:?}"))?;
    let metrics_listen = pick!(metrics_listen)
        .map(|a| a.parse::<SocketAddr>().with_context(|| format!("metrics listen address {a:?}")))
        .transpose()?;
    let defaults = CheckpointSettings::default();

    Ok(EffectiveConfig {
        database_url: pick!(database_url),
        listen,
        metrics_listen,
        quiescence_delay: Duration::from_millis(pick!(quiescence_ms).unwrap_or(DEFAULT_QUIESCENCE_MS)),
        checkpoint_keep_count: pick!(checkpoint_keep_count).unwrap_or(DEFAULT_KEEP_COUNT),
        default_checkpoint: CheckpointSettings {
            auto_checkpoint_enabled: pick!(auto_checkpoint_enabled).unwrap_or(defaults.auto_checkpoint_enabled),
            strategy: pick!(checkpoint_strategy).unwrap_or(defaults.strategy),
        },
        smart_policy: pick!(smart_policy).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn precedence_cli_over_env_over_file() {
        let file = ConsoleConfig {
            database_url: Some("sqlite://file.db".into()),
            listen: Some("127.0.0.1:1000".into()),
            quiescence_ms: Some(100),
            checkpoint_keep_count: Some(3),
            checkpoint_strategy: Some(CheckpointStrategy::PerPrompt),
            smart_policy: Some(SmartPolicyConfig {
                mutating_tools: vec!["apply_patch".into()],
                ..SmartPolicyConfig::default()
            }),
            ..ConsoleConfig::default()
        };
        let env = ConsoleConfig {
            listen: Some("127.0.0.1:2000".into()),
            quiescence_ms: Some(200),
            auto_checkpoint_enabled: Some(false),
            ..ConsoleConfig::default()
        };
        let cli = ConsoleConfig { listen: Some("127.0.0.1:3000".into()), ..ConsoleConfig::default() };

        let eff = resolve_effective_config(&file, &env, &cli).unwrap();
        assert_eq!(eff.listen, "127.0.0.1:3000".parse::<SocketAddr>().unwrap()); // cli
        assert_eq!(eff.quiescence_delay, Duration::from_millis(200)); // env
        assert_eq!(eff.database_url.as_deref(), Some("sqlite://file.db")); // file
        assert_eq!(eff.checkpoint_keep_count, 3); // file
        assert!(!eff.default_checkpoint.auto_checkpoint_enabled); // env
        assert_eq!(eff.default_checkpoint.strategy, CheckpointStrategy::PerPrompt); // file
        assert_eq!(eff.smart_policy.mutating_tools, vec!["apply_patch".to_string()]);
        assert_eq!(eff.metrics_listen, None);
    }

    #[test]
    fn defaults_when_all_layers_empty() {
        let empty = ConsoleConfig::default();
        let eff = resolve_effective_config(&empty, &empty, &empty).unwrap();
        assert_eq!(eff.listen, DEFAULT_LISTEN.parse::<SocketAddr>().unwrap());
        assert_eq!(eff.quiescence_delay, Duration::from_millis(500));
        assert_eq!(eff.checkpoint_keep_count, 10);
        assert_eq!(eff.default_checkpoint, CheckpointSettings::default());
        assert_eq!(eff.smart_policy, SmartPolicyConfig::default());
        assert!(eff.database_url.is_none());
    }

    #[test]
    fn env_layer_parses_prefixed_vars() {
        let vars: HashMap<&str, &str> = [
            ("SESSION_TIMELINE_LISTEN", "0.0.0.0:9000"),
            ("SESSION_TIMELINE_QUIESCENCE_MS", "750"),
            ("SESSION_TIMELINE_AUTO_CHECKPOINT", "off"),
            ("SESSION_TIMELINE_CHECKPOINT_STRATEGY", "per_tool_use"),
            ("SESSION_TIMELINE_DATABASE_URL", "  "),
        ]
        .into_iter()
        .collect();
        let env = ConsoleConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(env.listen.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(env.quiescence_ms, Some(750));
        assert_eq!(env.auto_checkpoint_enabled, Some(false));
        assert_eq!(env.checkpoint_strategy, Some(CheckpointStrategy::PerToolUse));
        assert_eq!(env.database_url, None);
    }

    #[test]
    fn bad_env_values_are_errors() {
        assert!(ConsoleConfig::from_lookup(|k| (k == "SESSION_TIMELINE_QUIESCENCE_MS").then(|| "soon".into())).is_err());
        assert!(ConsoleConfig::from_lookup(|k| (k == "SESSION_TIMELINE_CHECKPOINT_STRATEGY").then(|| "often".into())).is_err());
    }

    #[test]
    fn file_layer_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"checkpoint_keep_count": 4, "checkpoint_strategy": "manual"}"#).unwrap();
        let file = ConsoleConfig::load_file(&path).unwrap();
        assert_eq!(file.checkpoint_keep_count, Some(4));
        assert_eq!(file.checkpoint_strategy, Some(CheckpointStrategy::Manual));
        assert!(ConsoleConfig::load_file(&dir.path().join("missing.json")).is_err());
    }
}
