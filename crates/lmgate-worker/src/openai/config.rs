use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

fn default_completions_url() -> String {
    "https://api.openai.com/v1/completions".to_string()
}

fn default_fake_streaming_interval() -> f64 {
    9.0
}

fn default_cooldown_time() -> u64 {
    30
}

fn default_key_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeyManagerConfig {
    pub cooldown_time: u64,
    pub default_timeout: u64,
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self {
            cooldown_time: default_cooldown_time(),
            default_timeout: default_key_timeout(),
        }
    }
}

/// `settings` payload for `class: openai` entries in `worker.workers`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenAiWorkerConfig {
    pub models: Vec<String>,
    pub aliases: HashMap<String, String>,
    pub api_keys: Vec<String>,
    pub api_key: Option<String>,
    pub proxy: String,
    pub streaming: Option<bool>,
    pub fake_streaming_interval: f64,
    pub key_manager: KeyManagerConfig,
    pub headers: HashMap<String, String>,
    pub filters: Vec<String>,
    pub models_url: Option<String>,
    pub completions_url: String,
    pub embedding_url: Option<String>,
    pub overrides: HashMap<String, Option<Value>>,
}

impl Default for OpenAiWorkerConfig {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            aliases: HashMap::new(),
            api_keys: Vec::new(),
            api_key: None,
            proxy: String::new(),
            streaming: None,
            fake_streaming_interval: default_fake_streaming_interval(),
            key_manager: KeyManagerConfig::default(),
            headers: HashMap::new(),
            filters: Vec::new(),
            models_url: None,
            completions_url: default_completions_url(),
            embedding_url: None,
            overrides: HashMap::new(),
        }
    }
}

impl OpenAiWorkerConfig {
    /// `api_keys` plus the singular `api_key` shorthand, combined.
    pub fn all_keys(&self) -> Vec<String> {
        let mut keys = self.api_keys.clone();
        if let Some(key) = &self.api_key {
            keys.push(key.clone());
        }
        keys
    }
}
