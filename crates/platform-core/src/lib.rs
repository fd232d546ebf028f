use battle_domain::{BattleMode, ModeConfig, TokenAmount};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppEnv {
    Local,
    Dev,
    Test,
    Prod,
}

impl AppEnv {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Dev => "dev",
            Self::Test => "test",
            Self::Prod => "prod",
        }
    }
}

impl std::str::FromStr for AppEnv {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "dev" | "development" => Ok(Self::Dev),
            "test" => Ok(Self::Test),
            "prod" | "production" => Ok(Self::Prod),
            other => Err(ConfigError::InvalidEnv(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub app: AppSection,
    pub observability: ObservabilitySection,
    pub database: DatabaseSection,
    pub chain: ChainSection,
    pub modes: ModesSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSection {
    pub env: AppEnv,
    pub service_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilitySection {
    pub log_filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// Without a URL the server keeps all state in memory.
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSection {
    pub rpc_endpoint: String,
    pub token_contract: String,
    pub treasury_address: String,
    pub signer_address: String,
    pub rpc_timeout_ms: u64,
    pub max_gas_price_wei: u64,
    pub retry: RetrySection,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModesSection {
    pub free: ModeSection,
    pub ranked: ModeSection,
    pub wager: ModeSection,
}

/// Token amounts as decimal strings, e.g. `"2.5"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeSection {
    pub min_bet: String,
    pub max_bet: String,
    pub flat_reward: String,
}

impl ModeSection {
    fn new(min_bet: &str, max_bet: &str, flat_reward: &str) -> Self {
        Self {
            min_bet: min_bet.to_string(),
            max_bet: max_bet.to_string(),
            flat_reward: flat_reward.to_string(),
        }
    }

    pub fn to_mode_config(&self, mode: BattleMode) -> Result<ModeConfig, ConfigError> {
        let parse = |field: &'static str, raw: &str| {
            raw.parse::<TokenAmount>()
                .map_err(|e| ConfigError::InvalidAmount {
                    field: format!("modes.{}.{field}", mode.as_str().to_ascii_lowercase()),
                    detail: e.to_string(),
                })
        };
        let config = ModeConfig {
            mode,
            min_bet: parse("min_bet", &self.min_bet)?,
            max_bet: parse("max_bet", &self.max_bet)?,
            flat_reward: parse("flat_reward", &self.flat_reward)?,
        };
        if config.min_bet > config.max_bet {
            return Err(ConfigError::InvalidAmount {
                field: format!("modes.{}", mode.as_str().to_ascii_lowercase()),
                detail: format!("min_bet {} exceeds max_bet {}", config.min_bet, config.max_bet),
            });
        }
        Ok(config)
    }
}

impl ModesSection {
    pub fn mode_configs(&self) -> Result<Vec<ModeConfig>, ConfigError> {
        BattleMode::ALL
            .into_iter()
            .map(|mode| self.section(mode).to_mode_config(mode))
            .collect()
    }

    #[must_use]
    pub fn section(&self, mode: BattleMode) -> &ModeSection {
        match mode {
            BattleMode::Free => &self.free,
            BattleMode::Ranked => &self.ranked,
            BattleMode::Wager => &self.wager,
        }
    }

    fn section_mut(&mut self, mode: BattleMode) -> &mut ModeSection {
        match mode {
            BattleMode::Free => &mut self.free,
            BattleMode::Ranked => &mut self.ranked,
            BattleMode::Wager => &mut self.wager,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid APP_ENV value: {0}")]
    InvalidEnv(String),
    #[error("invalid value for {name}: {value}")]
    InvalidOverride { name: &'static str, value: String },
    #[error("invalid token amount in {field}: {detail}")]
    InvalidAmount { field: String, detail: String },
    #[error("unable to locate config directory (expected config/default.toml)")]
    ConfigDirNotFound,
    #[error("failed reading config file {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed parsing config file {path}: {source}")]
    ParseToml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
struct PartialAppConfig {
    app: Option<PartialAppSection>,
    observability: Option<PartialObservabilitySection>,
    database: Option<PartialDatabaseSection>,
    chain: Option<PartialChainSection>,
    modes: Option<PartialModesSection>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialAppSection {
    env: Option<AppEnv>,
    service_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialObservabilitySection {
    log_filter: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialDatabaseSection {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialChainSection {
    rpc_endpoint: Option<String>,
    token_contract: Option<String>,
    treasury_address: Option<String>,
    signer_address: Option<String>,
    rpc_timeout_ms: Option<u64>,
    max_gas_price_wei: Option<u64>,
    retry: Option<PartialRetrySection>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialRetrySection {
    max_attempts: Option<u32>,
    base_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialModesSection {
    free: Option<PartialModeSection>,
    ranked: Option<PartialModeSection>,
    wager: Option<PartialModeSection>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialModeSection {
    min_bet: Option<String>,
    max_bet: Option<String>,
    flat_reward: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let app_env = env::var("APP_ENV")
            .ok()
            .map(|value| value.parse())
            .transpose()?
            .unwrap_or(AppEnv::Local);
        let config_dir = resolve_config_dir()?;
        Self::load_from_dir_for_env(config_dir, app_env)
    }

    /// `default.toml` is required; `{env}.toml` is merged on top when present.
    pub fn load_from_dir_for_env(
        config_dir: impl AsRef<Path>,
        app_env: AppEnv,
    ) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let mut config = Self::default_for_env(app_env);
        merge_file(&mut config, &config_dir.join("default.toml"))?;
        let env_file = config_dir.join(format!("{}.toml", app_env.as_str()));
        if env_file.exists() {
            merge_file(&mut config, &env_file)?;
        }
        config.app.env = app_env;
        config.apply_env_overrides()?;
        Ok(config)
    }

    #[must_use]
    pub fn default_for_env(app_env: AppEnv) -> Self {
        Self {
            app: AppSection {
                env: app_env,
                service_name: "battle-server".to_string(),
            },
            observability: ObservabilitySection {
                log_filter: "info".to_string(),
            },
            database: DatabaseSection {
                url: None,
                max_connections: 10,
            },
            chain: ChainSection {
                rpc_endpoint: "http://127.0.0.1:8545".to_string(),
                token_contract: String::new(),
                treasury_address: String::new(),
                signer_address: String::new(),
                rpc_timeout_ms: 10_000,
                max_gas_price_wei: 100_000_000_000,
                retry: RetrySection {
                    max_attempts: 3,
                    base_backoff_ms: 200,
                    max_backoff_ms: 2_000,
                },
            },
            modes: ModesSection {
                free: ModeSection::new("0", "0", "10"),
                ranked: ModeSection::new("0", "0", "25"),
                wager: ModeSection::new("1", "1000", "0"),
            },
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(raw_env) = env::var("APP_ENV") {
            self.app.env = raw_env.parse()?;
        }
        if let Ok(service_name) = env::var("BATTLE_SERVER__SERVICE_NAME") {
            self.app.service_name = service_name;
        }
        if let Ok(url) = env::var("DATABASE__URL") {
            self.database.url = (!url.trim().is_empty()).then_some(url);
        }
        if let Ok(value) = env::var("CHAIN__RPC_ENDPOINT") {
            self.chain.rpc_endpoint = value;
        }
        if let Ok(value) = env::var("CHAIN__TOKEN_CONTRACT") {
            self.chain.token_contract = value;
        }
        if let Ok(value) = env::var("CHAIN__TREASURY_ADDRESS") {
            self.chain.treasury_address = value;
        }
        if let Ok(value) = env::var("CHAIN__SIGNER_ADDRESS") {
            self.chain.signer_address = value;
        }
        if let Ok(value) = env::var("CHAIN__MAX_GAS_PRICE_WEI") {
            self.chain.max_gas_price_wei =
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidOverride {
                        name: "CHAIN__MAX_GAS_PRICE_WEI",
                        value,
                    })?;
        }
        if let Ok(log_filter) = env::var("OBSERVABILITY__LOG_FILTER") {
            self.observability.log_filter = log_filter;
        } else if let Ok(log_filter) = env::var("RUST_LOG") {
            self.observability.log_filter = log_filter;
        }
        Ok(())
    }

    fn merge_partial(&mut self, partial: PartialAppConfig) {
        if let Some(app) = partial.app {
            if let Some(value) = app.env {
                self.app.env = value;
            }
            if let Some(value) = app.service_name {
                self.app.service_name = value;
            }
        }
        if let Some(observability) = partial.observability {
            if let Some(value) = observability.log_filter {
                self.observability.log_filter = value;
            }
        }
        if let Some(database) = partial.database {
            if database.url.is_some() {
                self.database.url = database.url;
            }
            if let Some(value) = database.max_connections {
                self.database.max_connections = value;
            }
        }
        if let Some(chain) = partial.chain {
            self.merge_chain(chain);
        }
        if let Some(modes) = partial.modes {
            for (mode, section) in [
                (BattleMode::Free, modes.free),
                (BattleMode::Ranked, modes.ranked),
                (BattleMode::Wager, modes.wager),
            ] {
                let Some(section) = section else {
                    continue;
                };
                let target = self.modes.section_mut(mode);
                if let Some(value) = section.min_bet {
                    target.min_bet = value;
                }
                if let Some(value) = section.max_bet {
                    target.max_bet = value;
                }
                if let Some(value) = section.flat_reward {
                    target.flat_reward = value;
                }
            }
        }
    }

    fn merge_chain(&mut self, chain: PartialChainSection) {
        if let Some(value) = chain.rpc_endpoint {
            self.chain.rpc_endpoint = value;
        }
        if let Some(value) = chain.token_contract {
            self.chain.token_contract = value;
        }
        if let Some(value) = chain.treasury_address {
            self.chain.treasury_address = value;
        }
        if let Some(value) = chain.signer_address {
            self.chain.signer_address = value;
        }
        if let Some(value) = chain.rpc_timeout_ms {
            self.chain.rpc_timeout_ms = value;
        }
        if let Some(value) = chain.max_gas_price_wei {
            self.chain.max_gas_price_wei = value;
        }
        if let Some(retry) = chain.retry {
            if let Some(value) = retry.max_attempts {
                self.chain.retry.max_attempts = value;
            }
            if let Some(value) = retry.base_backoff_ms {
                self.chain.retry.base_backoff_ms = value;
            }
            if let Some(value) = retry.max_backoff_ms {
                self.chain.retry.max_backoff_ms = value;
            }
        }
    }
}

fn merge_file(config: &mut AppConfig, path: &Path) -> Result<(), ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    let partial =
        toml::from_str::<PartialAppConfig>(&content).map_err(|source| ConfigError::ParseToml {
            path: path.display().to_string(),
            source,
        })?;
    config.merge_partial(partial);
    Ok(())
}

fn resolve_config_dir() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = env::var("BATTLE_PLATFORM_CONFIG_DIR") {
        return Ok(PathBuf::from(path));
    }

    let mut current_dir = env::current_dir().map_err(|_| ConfigError::ConfigDirNotFound)?;
    loop {
        let candidate = current_dir.join("config");
        if candidate.join("default.toml").exists() {
            return Ok(candidate);
        }
        if !current_dir.pop() {
            break;
        }
    }

    Err(ConfigError::ConfigDirNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_config_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "platform-core-{tag}-{}",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("time")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn config_loader_merges_default_and_env_files() {
        let base_dir = temp_config_dir("merge");
        std::fs::write(
            base_dir.join("default.toml"),
            r#"
[app]
service_name = "default-service"

[observability]
log_filter = "info"

[chain]
rpc_endpoint = "http://node:8545"
token_contract = "0xtoken"
treasury_address = "0xtreasury"

[chain.retry]
max_attempts = 5

[modes.wager]
min_bet = "2"
max_bet = "500"
"#,
        )
        .expect("write default.toml");
        std::fs::write(
            base_dir.join("dev.toml"),
            r#"
[app]
service_name = "dev-service"

[observability]
log_filter = "debug"

[database]
max_connections = 3

[modes.free]
flat_reward = "12.5"
"#,
        )
        .expect("write dev.toml");

        let config = AppConfig::load_from_dir_for_env(&base_dir, AppEnv::Dev).expect("load config");
        let expected_log_filter = std::env::var("OBSERVABILITY__LOG_FILTER")
            .ok()
            .or_else(|| std::env::var("RUST_LOG").ok())
            .unwrap_or_else(|| "debug".to_string());
        assert_eq!(config.app.env, AppEnv::Dev);
        assert_eq!(config.app.service_name, "dev-service");
        assert_eq!(config.observability.log_filter, expected_log_filter);
        assert_eq!(config.database.max_connections, 3);
        assert_eq!(config.chain.retry.max_attempts, 5);
        assert_eq!(config.chain.retry.base_backoff_ms, 200);
        assert_eq!(config.modes.wager.min_bet, "2");
        assert_eq!(config.modes.wager.max_bet, "500");
        assert_eq!(config.modes.free.flat_reward, "12.5");
        assert_eq!(config.modes.ranked.flat_reward, "25");
    }

    #[test]
    fn env_specific_file_is_optional() {
        let base_dir = temp_config_dir("optional");
        std::fs::write(
            base_dir.join("default.toml"),
            "[app]\nservice_name = \"only-default\"\n",
        )
        .expect("write default.toml");
        let config =
            AppConfig::load_from_dir_for_env(&base_dir, AppEnv::Prod).expect("load config");
        assert_eq!(config.app.env, AppEnv::Prod);
        assert_eq!(config.app.service_name, "only-default");
    }

    #[test]
    fn missing_default_file_is_an_error() {
        let base_dir = temp_config_dir("missing");
        let err = AppConfig::load_from_dir_for_env(&base_dir, AppEnv::Local)
            .expect_err("no default.toml");
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn mode_sections_convert_to_token_amounts() {
        let configs = AppConfig::default_for_env(AppEnv::Test)
            .modes
            .mode_configs()
            .expect("mode configs");
        assert_eq!(configs.len(), 3);
        let wager = configs
            .iter()
            .find(|c| c.mode == BattleMode::Wager)
            .expect("wager");
        assert_eq!(wager.min_bet, TokenAmount::from_whole_tokens(1));
        assert_eq!(wager.max_bet, TokenAmount::from_whole_tokens(1_000));

        let bad = ModeSection::new("5", "1", "0");
        assert!(matches!(
            bad.to_mode_config(BattleMode::Wager),
            Err(ConfigError::InvalidAmount { .. })
        ));
        let unparsable = ModeSection::new("one", "1", "0");
        assert!(unparsable.to_mode_config(BattleMode::Wager).is_err());
    }
}
