use std::env;

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,

    pub llm_api_key: String,
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_rpm: u32,
    pub llm_tpm: Option<u32>,
    pub llm_timeout_seconds: u64,
    /// USD per 1K prompt tokens, for the cost estimate.
    pub llm_prompt_price_per_1k: f64,
    pub llm_completion_price_per_1k: f64,

    pub max_queue_depth: usize,
    pub pre_filter_min_messages: usize,
    pub pre_filter_min_total_chars: usize,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_seconds: u64,
    pub shutdown_grace_seconds: u64,
    /// Recovery sweep cadence; 0 disables the periodic sweep.
    pub sweep_interval_seconds: u64,
    pub bulk_max_conversations: usize,
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            port: parse_env("PORT", 8080),

            llm_api_key: env::var("LLM_API_KEY").unwrap_or_default(),
            llm_base_url: env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.x.ai/v1".to_string()),
            llm_model: env::var("LLM_MODEL").unwrap_or_else(|_| "grok-4-latest".to_string()),
            llm_rpm: parse_env("LLM_RPM", 60),
            llm_tpm: env::var("LLM_TPM").ok().and_then(|s| s.parse().ok()),
            llm_timeout_seconds: parse_env("LLM_TIMEOUT_SECONDS", 60),
            llm_prompt_price_per_1k: parse_env("LLM_PROMPT_PRICE_PER_1K", 0.0),
            llm_completion_price_per_1k: parse_env("LLM_COMPLETION_PRICE_PER_1K", 0.0),

            max_queue_depth: parse_env("MAX_QUEUE_DEPTH", 1000),
            pre_filter_min_messages: parse_env("PRE_FILTER_MIN_MESSAGES", 2),
            pre_filter_min_total_chars: parse_env("PRE_FILTER_MIN_TOTAL_CHARS", 40),
            circuit_failure_threshold: parse_env("CIRCUIT_FAILURE_THRESHOLD", 5),
            circuit_cooldown_seconds: parse_env("CIRCUIT_COOLDOWN_SECONDS", 60),
            shutdown_grace_seconds: parse_env("SHUTDOWN_GRACE_SECONDS", 30),
            sweep_interval_seconds: parse_env("SWEEP_INTERVAL_SECONDS", 300),
            bulk_max_conversations: parse_env("BULK_MAX_CONVERSATIONS", 500),
        }
    }
}

#[cfg(test)]
impl Default for Config {
    /// Test configuration: in-memory store, no API key, production defaults.
    fn default() -> Self {
        Self {
            database_url: ":memory:".to_string(),
            port: 0,
            llm_api_key: String::new(),
            llm_base_url: "https://api.x.ai/v1".to_string(),
            llm_model: "grok-4-latest".to_string(),
            llm_rpm: 60,
            llm_tpm: None,
            llm_timeout_seconds: 60,
            llm_prompt_price_per_1k: 0.0,
            llm_completion_price_per_1k: 0.0,
            max_queue_depth: 1000,
            pre_filter_min_messages: 2,
            pre_filter_min_total_chars: 40,
            circuit_failure_threshold: 5,
            circuit_cooldown_seconds: 60,
            shutdown_grace_seconds: 30,
            sweep_interval_seconds: 0,
            bulk_max_conversations: 500,
        }
    }
}
