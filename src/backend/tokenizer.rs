use std::path::{Path, PathBuf};

/// Explicit hint first, then `tokenizer.json` and `tokenizer.bin` next to the
/// model file.
pub fn resolve_tokenizer_path(model_path: &Path, tokenizer_hint: Option<&Path>) -> Option<PathBuf> {
    if let Some(hint) = tokenizer_hint {
        if hint.exists() {
            return Some(hint.to_path_buf());
        }
        tracing::warn!(path = %hint.display(), "configured tokenizer not found, searching model directory");
    }

    let parent_dir = model_path.parent().unwrap_or(Path::new("."));
    ["tokenizer.json", "tokenizer.bin"]
        .iter()
        .map(|name| parent_dir.join(name))
        .find(|candidate| candidate.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("edge_llm_tok_{}_{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn explicit_hint_wins_when_present() {
        let dir = scratch_dir("hint");
        let hint = dir.join("custom.json");
        std::fs::write(&hint, "{}").expect("hint");
        std::fs::write(dir.join("tokenizer.json"), "{}").expect("sibling");

        let resolved = resolve_tokenizer_path(&dir.join("model.gguf"), Some(&hint));
        assert_eq!(resolved, Some(hint));
    }

    #[test]
    fn falls_back_to_model_directory() {
        let dir = scratch_dir("sibling");
        std::fs::write(dir.join("tokenizer.bin"), "").expect("bin");
        let model = dir.join("model.gguf");

        assert_eq!(
            resolve_tokenizer_path(&model, Some(&dir.join("missing.json"))),
            Some(dir.join("tokenizer.bin"))
        );

        std::fs::write(dir.join("tokenizer.json"), "{}").expect("json");
        assert_eq!(resolve_tokenizer_path(&model, None), Some(dir.join("tokenizer.json")));
    }

    #[test]
    fn nothing_found_is_none() {
        let dir = scratch_dir("empty");
        assert_eq!(resolve_tokenizer_path(&dir.join("model.gguf"), None), None);
    }
}
