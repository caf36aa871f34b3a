use std::sync::LazyLock;

use probe_core::types::FinalAnswer;
use regex::Regex;

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\r?\n(.*?)```").expect("static regex")
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnswerError {
    #[error("model produced no final answer")]
    Missing,
    #[error("final answer is not valid JSON: {0}")]
    Malformed(String),
}

/// Pull the structured verdict out of the model's last message.
///
/// Fenced ```json blocks are tried last-to-first, then the outermost
/// `{...}` span of the whole text.
pub fn parse_final_answer(text: &str) -> Result<FinalAnswer, AnswerError> {
    if text.trim().is_empty() {
        return Err(AnswerError::Missing);
    }

    let mut last_error = None;
    let fenced: Vec<&str> = FENCED_JSON
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    for block in fenced.iter().rev() {
        match serde_json::from_str::<FinalAnswer>(block.trim()) {
            Ok(answer) => return Ok(answer),
            Err(e) => last_error = Some(e.to_string()),
        }
    }

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            match serde_json::from_str::<FinalAnswer>(&text[start..=end]) {
                Ok(answer) => return Ok(answer),
                Err(e) => last_error = Some(e.to_string()),
            }
        }
    }

    match last_error {
        Some(e) => Err(AnswerError::Malformed(e)),
        None => Err(AnswerError::Missing),
    }
}
