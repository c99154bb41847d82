use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoMode {
    Http,
    Console,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    pub calendar_path: PathBuf,
    pub business_config: PathBuf,
    pub io_mode: IoMode,
    pub llm_provider: String,
    pub groq_api_key: String,
    pub groq_model: String,
    pub ollama_url: String,
    pub ollama_model: String,
    pub interpret_timeout: Duration,
    pub usage_limit_dollars: f64,
    pub cost_per_1k_tokens: f64,
    pub twilio_auth_token: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            database_url: "receptionist.db".to_string(),
            calendar_path: PathBuf::from("data/calendar/appointments.ics"),
            business_config: PathBuf::from("config/business.json"),
            io_mode: IoMode::Http,
            llm_provider: "ollama".to_string(),
            groq_api_key: String::new(),
            groq_model: "llama-3.1-8b-instant".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            ollama_model: "llama3.2".to_string(),
            interpret_timeout: Duration::from_secs(8),
            usage_limit_dollars: 4.50,
            cost_per_1k_tokens: 0.002,
            twilio_auth_token: String::new(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: parsed("PORT").unwrap_or(defaults.port),
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            calendar_path: env::var("CALENDAR_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.calendar_path),
            business_config: env::var("BUSINESS_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.business_config),
            io_mode: match env::var("IO_MODE").as_deref() {
                Ok("console") => IoMode::Console,
                _ => IoMode::Http,
            },
            llm_provider: env::var("LLM_PROVIDER")
                .map(|v| v.to_lowercase())
                .unwrap_or(defaults.llm_provider),
            groq_api_key: env::var("GROQ_API_KEY").unwrap_or_default(),
            groq_model: env::var("GROQ_MODEL").unwrap_or(defaults.groq_model),
            ollama_url: env::var("OLLAMA_URL").unwrap_or(defaults.ollama_url),
            ollama_model: env::var("OLLAMA_MODEL").unwrap_or(defaults.ollama_model),
            interpret_timeout: parsed("INTERPRET_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.interpret_timeout),
            usage_limit_dollars: parsed("USAGE_LIMIT_DOLLARS").unwrap_or(defaults.usage_limit_dollars),
            cost_per_1k_tokens: parsed("COST_PER_1K_TOKENS").unwrap_or(defaults.cost_per_1k_tokens),
            twilio_auth_token: env::var("TWILIO_AUTH_TOKEN").unwrap_or_default(),
        }
    }
}

fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
