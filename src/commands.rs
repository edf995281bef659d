use crate::config::BackendPreference;
use crate::error::EngineError;
use crate::engine::GenerationOutcome;

pub const DEFAULT_ERROR_RESPONSE: &str =
    "I apologize, but I encountered an error generating a response. Please try again.";
pub const EMPTY_RESPONSE_ERROR: &str =
    "I apologize, but I couldn't generate a proper response. Please try rephrasing your question.";
pub const INPUT_TOO_LONG_ERROR: &str =
    "I apologize, but your input is too long. Please try breaking it into smaller parts.";

#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Empty,
    Chat(String),
    Reset,
    Set(String),
    Backend(Option<BackendPreference>),
    Stats,
    Help,
    Quit,
}

impl ReplCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Empty);
        }
        let Some(command) = line.strip_prefix('/') else {
            return Ok(Self::Chat(line.to_string()));
        };

        let mut parts = command.splitn(2, char::is_whitespace);
        let verb = parts.next().unwrap_or("").to_lowercase();
        let arg = parts.next().map(str::trim).unwrap_or("");

        match verb.as_str() {
            "reset" | "clear" => Ok(Self::Reset),
            "set" => {
                if arg.is_empty() {
                    Err("/set needs key=value pairs, e.g. /set temperature=0.5,top_k=3".to_string())
                } else {
                    Ok(Self::Set(arg.to_string()))
                }
            }
            "backend" => match arg.to_lowercase().as_str() {
                "" => Ok(Self::Backend(None)),
                "cpu" => Ok(Self::Backend(Some(BackendPreference::Cpu))),
                "accelerator" | "mtk" | "npu" => Ok(Self::Backend(Some(BackendPreference::Accelerator))),
                other => Err(format!("Unknown backend '{}'. Use cpu or accelerator.", other)),
            },
            "stats" => Ok(Self::Stats),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" | "q" => Ok(Self::Quit),
            _ => Err(format!("Unknown command: /{}", verb)),
        }
    }
}

pub const HELP_TEXT: &str = "\
/reset                     clear the conversation
/set key=value[,...]       change sampling (max_tokens, temperature, top_k, top_p, repetition_penalty, frequency_penalty)
/backend [cpu|accelerator] show or switch the inference backend
/stats                     print engine counters as JSON
/quit                      leave";

/// What the chat surface shows for a finished request.
pub fn user_facing_reply(result: &Result<GenerationOutcome, EngineError>) -> String {
    match result {
        Ok(outcome) if outcome.text().trim().is_empty() => EMPTY_RESPONSE_ERROR.to_string(),
        Ok(outcome) => outcome.text().to_string(),
        Err(EngineError::PromptTooLong { .. }) => INPUT_TOO_LONG_ERROR.to_string(),
        Err(_) => DEFAULT_ERROR_RESPONSE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_chat() {
        assert_eq!(ReplCommand::parse("  hello there "), Ok(ReplCommand::Chat("hello there".to_string())));
        assert_eq!(ReplCommand::parse("   "), Ok(ReplCommand::Empty));
    }

    #[test]
    fn slash_commands_parse() {
        assert_eq!(ReplCommand::parse("/reset"), Ok(ReplCommand::Reset));
        assert_eq!(ReplCommand::parse("/QUIT"), Ok(ReplCommand::Quit));
        assert_eq!(
            ReplCommand::parse("/set temperature=0.5, top_k=3"),
            Ok(ReplCommand::Set("temperature=0.5, top_k=3".to_string()))
        );
        assert_eq!(ReplCommand::parse("/backend"), Ok(ReplCommand::Backend(None)));
        assert_eq!(
            ReplCommand::parse("/backend mtk"),
            Ok(ReplCommand::Backend(Some(BackendPreference::Accelerator)))
        );
        assert!(ReplCommand::parse("/set").is_err());
        assert!(ReplCommand::parse("/backend gpu").is_err());
        assert!(ReplCommand::parse("/dance").is_err());
    }

    #[test]
    fn failures_map_to_canned_replies() {
        let too_long = Err(EngineError::PromptTooLong { estimated: 9000, budget: 3072 });
        assert_eq!(user_facing_reply(&too_long), INPUT_TOO_LONG_ERROR);
        assert_eq!(
            user_facing_reply(&Err(EngineError::Generation("x".to_string()))),
            DEFAULT_ERROR_RESPONSE
        );
        assert_eq!(
            user_facing_reply(&Ok(GenerationOutcome::Completed("  ".to_string()))),
            EMPTY_RESPONSE_ERROR
        );
        assert_eq!(
            user_facing_reply(&Ok(GenerationOutcome::Cancelled("partial".to_string()))),
            "partial"
        );
    }
}
