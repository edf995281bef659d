//! Prompt/history assembly under a token budget.
//!
//! The prompt is `system + history + user`, where the history block renders
//! the trailing `lookback` turns through the per-turn template. When the
//! estimated cost exceeds the budget, the oldest turn of the window is dropped
//! and the prompt re-rendered until it fits or the window is empty.

use minijinja::{context, Environment};

use crate::error::{EngineError, Result};
use crate::history::ConversationTurn;
use crate::prompting::PromptTemplates;

const FORMATTING_OVERHEAD_TOKENS: usize = 20;

/// Cheap closed-form token estimate: ASCII ~1/4 token, CJK ideographs 2
/// tokens, everything else ~1.5 tokens, plus a fixed formatting overhead.
/// Empty text costs nothing.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }

    let mut ascii = 0usize;
    let mut cjk = 0usize;
    let mut other = 0usize;
    for c in text.chars() {
        match c as u32 {
            0x0000..=0x007F => ascii += 1,
            0x4E00..=0x9FFF => cjk += 1,
            _ => other += 1,
        }
    }

    (ascii as f64 / 4.0).round() as usize
        + cjk * 2
        + (other as f64 * 1.5).round() as usize
        + FORMATTING_OVERHEAD_TOKENS
}

pub struct PromptAssembler {
    env: Environment<'static>,
    templates: PromptTemplates,
    system_prompt: String,
    lookback: usize,
}

impl PromptAssembler {
    pub fn new(templates: PromptTemplates, system_prompt: impl Into<String>, lookback: usize) -> Self {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        Self {
            env,
            templates,
            system_prompt: system_prompt.into(),
            lookback,
        }
    }

    pub fn lookback(&self) -> usize {
        self.lookback
    }

    pub fn render_system(&self) -> Result<String> {
        Ok(self.env.render_str(
            &self.templates.system,
            context! { system_prompt => self.system_prompt.as_str() },
        )?)
    }

    pub fn render_user(&self, user_text: &str) -> Result<String> {
        Ok(self
            .env
            .render_str(&self.templates.user, context! { content => user_text })?)
    }

    pub fn render_history(&self, turns: &[ConversationTurn]) -> Result<String> {
        let mut block = String::new();
        for turn in turns {
            let rendered = self.env.render_str(
                &self.templates.turn,
                context! {
                    role => turn.role.as_str(),
                    content => turn.text.as_str(),
                    has_image => turn.image.is_some(),
                },
            )?;
            block.push_str(&rendered);
        }
        Ok(block)
    }

    /// The lookback-bounded suffix of `history`.
    pub fn window<'a>(&self, history: &'a [ConversationTurn]) -> &'a [ConversationTurn] {
        let start = history.len().saturating_sub(self.lookback);
        &history[start..]
    }

    /// Builds the prompt, trimming the oldest windowed turns until the
    /// estimate fits `budget` or no history is left. Never touches `history`.
    pub fn format_prompt(
        &self,
        user_text: &str,
        history: &[ConversationTurn],
        budget: usize,
    ) -> Result<String> {
        let system = self.render_system()?;
        let user = self.render_user(user_text)?;

        let mut window = self.window(history);
        loop {
            let prompt = format!("{}{}{}", system, self.render_history(window)?, user);
            if estimate_tokens(&prompt) <= budget || window.is_empty() {
                if window.len() < history.len().min(self.lookback) {
                    tracing::debug!(
                        kept = window.len(),
                        budget,
                        "trimmed conversation history to fit input budget"
                    );
                }
                return Ok(prompt);
            }
            window = &window[1..];
        }
    }

    /// Rejects a request whose formatted user turn alone does not fit.
    pub fn check_user_fits(&self, user_text: &str, budget: usize) -> Result<()> {
        let estimated = estimate_tokens(&self.render_user(user_text)?);
        if estimated >= budget {
            return Err(EngineError::PromptTooLong { estimated, budget });
        }
        Ok(())
    }

    /// Admission check followed by [`format_prompt`](Self::format_prompt).
    pub fn assemble(
        &self,
        user_text: &str,
        history: &[ConversationTurn],
        budget: usize,
    ) -> Result<String> {
        self.check_user_fits(user_text, budget)?;
        self.format_prompt(user_text, history, budget)
    }
}
