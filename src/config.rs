use dotenvy::dotenv;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::str::FromStr;

/// Which OpenAI endpoint the completion gateway talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionMode {
    /// `/chat/completions`, prompt sent as a single user message
    Chat,
    /// legacy `/completions`, prompt sent verbatim
    Completion,
}

impl FromStr for CompletionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" => Ok(CompletionMode::Chat),
            "completion" | "text" => Ok(CompletionMode::Completion),
            other => Err(anyhow::anyhow!("unknown completion mode: {}", other)),
        }
    }
}

/// Conversation behaviour handed to the context builder and callback handler.
#[derive(Clone, Debug)]
pub struct ConversationConfig {
    pub close_session_flag: String,
    pub close_session_reply: String,
    pub enable_enter_event: bool,
    pub enter_event_reply: String,
    /// Maximum number of answered turns replayed into a prompt
    pub session_turns: usize,
    /// Prompt length bound, in Unicode code points
    pub max_prompt_chars: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            close_session_flag: "/close".to_string(),
            close_session_reply: DEFAULT_CLOSE_SESSION_REPLY.to_string(),
            enable_enter_event: false,
            enter_event_reply: DEFAULT_ENTER_EVENT_REPLY.to_string(),
            session_turns: 10,
            max_prompt_chars: 4000,
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub http_addr: String,
    pub log_level: String,
    pub lark_app_id: String,
    pub lark_app_secret: String,
    pub lark_verification_token: Option<String>,
    pub lark_encrypt_key: Option<String>,
    pub lark_base_url: String,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub openai_model: String,
    pub openai_mode: CompletionMode,
    pub openai_max_tokens: u32,
    pub openai_temperature: f32,
    pub openai_top_p: f32,
    pub openai_presence_penalty: f32,
    pub llm_timeout_secs: u64,
    pub database_url: String,
    pub conversation: ConversationConfig,
    pub event_dedup_capacity: usize,
}

const DEFAULT_CLOSE_SESSION_REPLY: &str = "Session closed. Send a new message to start over.";
const DEFAULT_ENTER_EVENT_REPLY: &str =
    "Hi! Ask me anything. Send /close at any time to start a fresh conversation.";
const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// Key/value view over the optional TOML file and the process environment.
///
/// TOML tables are flattened to upper-snake keys, so `[lark] app_id` is read as
/// `LARK_APP_ID`. Environment variables always win over the file.
pub struct Source {
    file: HashMap<String, String>,
    env: HashMap<String, String>,
}

impl Source {
    pub fn new(file: HashMap<String, String>, env: HashMap<String, String>) -> Self {
        Self { file, env }
    }

    fn load() -> anyhow::Result<Self> {
        let env: HashMap<String, String> = env::vars().collect();
        let path = env
            .get("LARKGPT_CONFIG")
            .cloned()
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());

        let file = match fs::read_to_string(&path) {
            Ok(content) => flatten_toml(&content)
                .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {}", path, e))?,
            Err(_) => HashMap::new(),
        };

        Ok(Self::new(file, env))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.env
            .get(key)
            .or_else(|| self.file.get(key))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> anyhow::Result<String> {
        self.get(key)
            .ok_or_else(|| anyhow::anyhow!("{} must be set", key))
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Like `string_or`, but an explicitly empty value is kept.
    fn text_or(&self, key: &str, default: &str) -> String {
        self.env
            .get(key)
            .or_else(|| self.file.get(key))
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| default.to_string())
    }

    fn parsed_or<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }
}

/// Flattens a TOML document into `SECTION_KEY` pairs.
pub fn flatten_toml(content: &str) -> anyhow::Result<HashMap<String, String>> {
    let table: toml::Table = toml::from_str(content)?;
    let mut out = HashMap::new();
    flatten_table("", &table, &mut out);
    Ok(out)
}

fn flatten_table(prefix: &str, table: &toml::Table, out: &mut HashMap<String, String>) {
    for (key, value) in table {
        let full_key = if prefix.is_empty() {
            key.to_ascii_uppercase()
        } else {
            format!("{}_{}", prefix, key.to_ascii_uppercase())
        };
        match value {
            toml::Value::Table(inner) => flatten_table(&full_key, inner, out),
            toml::Value::String(s) => {
                out.insert(full_key, s.clone());
            }
            toml::Value::Array(_) => {}
            other => {
                out.insert(full_key, other.to_string());
            }
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build(&Source::load()?)
    }

    pub fn build(source: &Source) -> anyhow::Result<Self> {
        let defaults = ConversationConfig::default();

        Ok(Config {
            http_addr: source.string_or("HTTP_ADDR", "0.0.0.0:8080"),
            log_level: source.string_or("LOG_LEVEL", "info"),
            lark_app_id: source.required("LARK_APP_ID")?,
            lark_app_secret: source.required("LARK_APP_SECRET")?,
            lark_verification_token: source.get("LARK_VERIFICATION_TOKEN"),
            lark_encrypt_key: source.get("LARK_ENCRYPT_KEY"),
            lark_base_url: source
                .string_or("LARK_BASE_URL", "https://open.feishu.cn")
                .trim_end_matches('/')
                .to_string(),
            openai_api_key: source.required("OPENAI_API_KEY")?,
            openai_base_url: source.string_or("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            openai_model: source.string_or("OPENAI_MODEL", "gpt-3.5-turbo"),
            openai_mode: match source.get("OPENAI_MODE") {
                Some(mode) => mode.parse()?,
                None => CompletionMode::Chat,
            },
            openai_max_tokens: source.parsed_or("OPENAI_MAX_TOKENS", 1500),
            openai_temperature: source.parsed_or("OPENAI_TEMPERATURE", 0.9),
            openai_top_p: source.parsed_or("OPENAI_TOP_P", 1.0),
            openai_presence_penalty: source.parsed_or("OPENAI_PRESENCE_PENALTY", 0.6),
            llm_timeout_secs: source.parsed_or("LLM_TIMEOUT_SECS", 120),
            database_url: source.string_or("DATABASE_URL", "data/larkgpt.db"),
            conversation: ConversationConfig {
                close_session_flag: source
                    .string_or("CONVERSATION_CLOSE_SESSION_FLAG", &defaults.close_session_flag),
                close_session_reply: source
                    .text_or("CONVERSATION_CLOSE_SESSION_REPLY", &defaults.close_session_reply),
                enable_enter_event: source
                    .parsed_or("CONVERSATION_ENABLE_ENTER_EVENT", defaults.enable_enter_event),
                enter_event_reply: source
                    .text_or("CONVERSATION_ENTER_EVENT_REPLY", &defaults.enter_event_reply),
                session_turns: source
                    .parsed_or("CONVERSATION_SESSION_TURNS", defaults.session_turns)
                    .max(1),
                max_prompt_chars: source
                    .parsed_or("CONVERSATION_MAX_PROMPT_CHARS", defaults.max_prompt_chars)
                    .max(1),
            },
            event_dedup_capacity: source.parsed_or("EVENT_DEDUP_CAPACITY", 1024),
        })
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("http_addr", &self.http_addr)
            .field("log_level", &self.log_level)
            .field("lark_app_id", &self.lark_app_id)
            .field("lark_app_secret", &"[REDACTED]")
            .field(
                "lark_verification_token",
                &self.lark_verification_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field(
                "lark_encrypt_key",
                &self.lark_encrypt_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("lark_base_url", &self.lark_base_url)
            .field("openai_api_key", &"[REDACTED]")
            .field("openai_base_url", &self.openai_base_url)
            .field("openai_model", &self.openai_model)
            .field("openai_mode", &self.openai_mode)
            .field("openai_max_tokens", &self.openai_max_tokens)
            .field("openai_temperature", &self.openai_temperature)
            .field("openai_top_p", &self.openai_top_p)
            .field("openai_presence_penalty", &self.openai_presence_penalty)
            .field("llm_timeout_secs", &self.llm_timeout_secs)
            .field("database_url", &self.database_url)
            .field("conversation", &self.conversation)
            .field("event_dedup_capacity", &self.event_dedup_capacity)
            .finish()
    }
}
