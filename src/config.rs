//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `VAMSH__*` 覆盖（双下划线表示嵌套，如 `VAMSH__AGENT__BASE_URL=http://10.0.0.2:8000`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub agent: AgentSection,
    pub retry: RetrySection,
    pub circuit: CircuitSection,
    pub monitor: MonitorSection,
    pub handoff: HandoffSection,
    pub llm: LlmSection,
}

/// [app] 段：数据目录与数据库文件
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    pub data_dir: PathBuf,
    /// 相对 data_dir 的 SQLite 文件名
    pub database: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            data_dir: PathBuf::from("data"),
            database: "vamsh_bridge.db".to_string(),
        }
    }
}

impl AppSection {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database)
    }
}

/// [agent] 段：Vamsh 服务地址、单次请求超时、网关内部的小重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub base_url: String,
    pub ws_url: String,
    /// 熔断键中的服务名
    pub service_name: String,
    pub request_timeout_secs: u64,
    pub internal_retries: u32,
    pub internal_retry_delay_ms: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            ws_url: "ws://localhost:8000/ws".to_string(),
            service_name: "vamsh".to_string(),
            request_timeout_secs: 10,
            internal_retries: 1,
            internal_retry_delay_ms: 250,
        }
    }
}

/// [retry] 段：执行器默认重试策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

/// [circuit] 段：熔断阈值、冷却时间、失败历史容量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitSection {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub history_limit: usize,
}

impl Default for CircuitSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
            history_limit: 100,
        }
    }
}

/// [monitor] 段：轮询间隔与停滞阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub poll_interval_secs: u64,
    pub warning_after_mins: i64,
    pub stuck_after_mins: i64,
    pub enable_streaming: bool,
    /// Vamsh 报告 inactive 而本地仍 active 时是否视为完成；false 时记为 interrupted 并告警
    pub inactive_means_completed: bool,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            warning_after_mins: 15,
            stuck_after_mins: 30,
            enable_streaming: true,
            inactive_means_completed: true,
        }
    }
}

/// [handoff] 段：交接后等待确认的上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandoffSection {
    pub ack_timeout_secs: u64,
    pub ack_poll_interval_ms: u64,
}

impl Default for HandoffSection {
    fn default() -> Self {
        Self {
            ack_timeout_secs: 30,
            ack_poll_interval_ms: 2000,
        }
    }
}

/// [llm] 段：规格与任务拆分所用的模型
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            base_url: Some("https://api.deepseek.com/v1".to_string()),
            api_key: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 120 }
    }
}

/// 从 config 目录加载配置，环境变量 VAMSH__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 VAMSH__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("VAMSH")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.circuit.failure_threshold, 5);
        assert_eq!(cfg.monitor.poll_interval_secs, 5);
        assert_eq!(cfg.monitor.warning_after_mins, 15);
        assert_eq!(cfg.monitor.stuck_after_mins, 30);
        assert!(cfg.monitor.inactive_means_completed);
        assert_eq!(
            cfg.app.database_path(),
            PathBuf::from("data").join("vamsh_bridge.db")
        );
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(
            &path,
            "[agent]\nbase_url = \"http://10.0.0.2:9000\"\n\n[monitor]\npoll_interval_secs = 2\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.agent.base_url, "http://10.0.0.2:9000");
        assert_eq!(cfg.monitor.poll_interval_secs, 2);
        assert_eq!(cfg.agent.service_name, "vamsh");
    }
}
