use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PromptFamily {
    #[default]
    Llama,
    Qwen,
    Mistral,
    Unknown,
}

/// Jinja sources for the three prompt pieces. `system` sees `system_prompt`,
/// `user` and `turn` see `content`; `turn` additionally sees `role`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplates {
    pub system: String,
    pub user: String,
    pub turn: String,
}

impl PromptTemplates {
    pub fn defaults_for(family: PromptFamily) -> Self {
        match family {
            PromptFamily::Llama => Self {
                system: "<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\n{{ system_prompt }}<|eot_id|>".to_string(),
                user: "<|start_header_id|>user<|end_header_id|>\n\n{{ content }}<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n".to_string(),
                turn: "<|start_header_id|>{{ role }}<|end_header_id|>\n\n{{ content }}<|eot_id|>".to_string(),
            },
            PromptFamily::Qwen => Self {
                system: "<|im_start|>system\n{{ system_prompt }}<|im_end|>\n".to_string(),
                user: "<|im_start|>user\n{{ content }}<|im_end|>\n<|im_start|>assistant\n".to_string(),
                turn: "<|im_start|>{{ role }}\n{{ content }}<|im_end|>\n".to_string(),
            },
            PromptFamily::Mistral => Self {
                system: "<s>[INST] {{ system_prompt }} [/INST]</s>".to_string(),
                user: "[INST] {{ content }} [/INST]".to_string(),
                turn: "{% if role == 'user' %}[INST] {{ content }} [/INST]{% else %} {{ content }}</s>{% endif %}".to_string(),
            },
            PromptFamily::Unknown => Self {
                system: "[system]\n{{ system_prompt }}\n[/system]\n".to_string(),
                user: "[user]\n{{ content }}\n[/user]\n[assistant]\n".to_string(),
                turn: "[{{ role }}]\n{{ content }}\n[/{{ role }}]\n".to_string(),
            },
        }
    }
}

pub fn default_stop_tokens(family: PromptFamily) -> Vec<String> {
    let markers: &[&str] = match family {
        PromptFamily::Llama => &["<|eot_id|>", "<|end_of_text|>"],
        PromptFamily::Qwen => &["<|im_end|>", "<|endoftext|>"],
        PromptFamily::Mistral => &["</s>"],
        PromptFamily::Unknown => &["<|end_of_text|>", "</s>", "<|endoftext|>"],
    };
    markers.iter().map(|m| m.to_string()).collect()
}

/// Marker tokens after which the model's visible answer begins.
pub fn default_assistant_markers(family: PromptFamily) -> Vec<String> {
    let markers: &[&str] = match family {
        PromptFamily::Llama => &["<|end_header_id|>"],
        PromptFamily::Qwen => &["<|im_start|>"],
        PromptFamily::Mistral => &["[/INST]"],
        PromptFamily::Unknown => &[],
    };
    markers.iter().map(|m| m.to_string()).collect()
}

pub const SPECIAL_TOKEN_OPEN: &str = "<|";
pub const SPECIAL_TOKEN_CLOSE: &str = "|>";

/// How raw native tokens are classified before they reach the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFilter {
    pub stop_tokens: Vec<String>,
    pub assistant_markers: Vec<String>,
    pub require_assistant_marker: bool,
    pub special_open: String,
    pub special_close: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenClass {
    Stop,
    AssistantMarker,
    Marker,
    Visible,
}

impl StreamFilter {
    pub fn for_family(family: PromptFamily) -> Self {
        Self {
            stop_tokens: default_stop_tokens(family),
            assistant_markers: default_assistant_markers(family),
            require_assistant_marker: false,
            special_open: SPECIAL_TOKEN_OPEN.to_string(),
            special_close: SPECIAL_TOKEN_CLOSE.to_string(),
        }
    }

    pub fn classify(&self, token: &str) -> TokenClass {
        let trimmed = token.trim();
        if self.stop_tokens.iter().any(|stop| stop == trimmed) {
            return TokenClass::Stop;
        }
        if self.assistant_markers.iter().any(|m| m == trimmed) {
            return TokenClass::AssistantMarker;
        }
        if self.is_bare_marker(trimmed) {
            return TokenClass::Marker;
        }
        TokenClass::Visible
    }

    /// A token delimited by the special-token brackets whose text, once every
    /// delimited span is removed, is empty.
    fn is_bare_marker(&self, token: &str) -> bool {
        if !(token.starts_with(&self.special_open) && token.ends_with(&self.special_close)) {
            return false;
        }
        if token.len() < self.special_open.len() + self.special_close.len() {
            return false;
        }

        let mut rest = token;
        loop {
            let Some(start) = rest.find(&self.special_open) else {
                return rest.trim().is_empty();
            };
            if !rest[..start].trim().is_empty() {
                return false;
            }
            let after_open = &rest[start + self.special_open.len()..];
            let Some(end) = after_open.find(&self.special_close) else {
                return false;
            };
            rest = &after_open[end + self.special_close.len()..];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qwen_stop_markers_are_detected() {
        let filter = StreamFilter::for_family(PromptFamily::Qwen);
        assert_eq!(filter.classify("<|im_end|>"), TokenClass::Stop);
        assert_eq!(filter.classify("<|endoftext|>"), TokenClass::Stop);
        assert_eq!(filter.classify("plain text"), TokenClass::Visible);
    }

    #[test]
    fn llama_stop_token_matches_with_surrounding_whitespace() {
        let filter = StreamFilter::for_family(PromptFamily::Llama);
        assert_eq!(filter.classify("<|eot_id|>"), TokenClass::Stop);
        assert_eq!(filter.classify(" <|eot_id|>\n"), TokenClass::Stop);
        assert_eq!(filter.classify("<|eot_id|> bye"), TokenClass::Visible);
    }

    #[test]
    fn bare_markers_are_separated_from_content() {
        let filter = StreamFilter::for_family(PromptFamily::Llama);
        assert_eq!(filter.classify("<|start_header_id|>"), TokenClass::Marker);
        assert_eq!(filter.classify("<|a|><|b|>"), TokenClass::Marker);
        assert_eq!(filter.classify("<|a|>hi<|b|>"), TokenClass::Visible);
        assert_eq!(filter.classify("<|end_header_id|>"), TokenClass::AssistantMarker);
        assert_eq!(filter.classify("<|>"), TokenClass::Visible);
        assert_eq!(filter.classify("a <| b |> c"), TokenClass::Visible);
    }

    #[test]
    fn llama_and_qwen_templates_include_expected_tokens() {
        let llama = PromptTemplates::defaults_for(PromptFamily::Llama);
        assert!(llama.system.contains("<|start_header_id|>system<|end_header_id|>"));
        assert!(llama.user.contains("<|eot_id|>"));

        let qwen = PromptTemplates::defaults_for(PromptFamily::Qwen);
        assert!(qwen.system.contains("<|im_start|>system"));
        assert!(qwen.turn.contains("<|im_end|>"));
    }
}
