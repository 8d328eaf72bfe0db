use serde::Deserialize;

/// HF `config.json` of the language model.
///
/// Only the fields the fusion path needs are typed; every other key,
/// including the multimodal `mm_*` settings, lands in `extra`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub model_type: Option<String>,
    pub hidden_size: usize,
    pub vocab_size: usize,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub pad_token_id: Option<u32>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architectures: vec!["VideoLlavaQwenForCausalLM".to_string()],
            model_type: Some("video_llava_qwen".to_string()),
            hidden_size: 3584,
            vocab_size: 152_064,
            bos_token_id: None,
            pad_token_id: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl ModelConfig {
    pub fn extra_usize(&self, key: &str) -> Option<usize> {
        self.extra.get(key).and_then(|v| v.as_u64()).map(|v| v as usize)
    }

    pub fn extra_i64(&self, key: &str) -> Option<i64> {
        self.extra.get(key).and_then(|v| v.as_i64())
    }

    pub fn extra_bool(&self, key: &str) -> Option<bool> {
        self.extra.get(key).and_then(|v| v.as_bool())
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }
}
