//! Keyword replies for the snowball command.

use async_trait::async_trait;
use snowbridge::{HandlerError, RequestHandler};

pub const FALLBACK_REPLY: &str = "I don't understand that command yet!";

/// Phrase to reply pairs, checked in order. Matching is a case-insensitive
/// substring test against the whole request.
const KEYWORDS: &[(&str, &str)] = &[
    ("generate grass", "Generating grass terrain..."),
    ("build house", "Building house..."),
];

#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordHandler;

impl KeywordHandler {
    pub fn reply(&self, text: &str) -> &'static str {
        let lowered = text.to_lowercase();
        KEYWORDS
            .iter()
            .find(|(phrase, _)| lowered.contains(phrase))
            .map(|(_, reply)| *reply)
            .unwrap_or(FALLBACK_REPLY)
    }
}

#[async_trait]
impl RequestHandler for KeywordHandler {
    async fn process(&self, text: String) -> Result<String, HandlerError> {
        let reply = self.reply(&text);
        tracing::debug!(request = %text, reply, "Matched request");
        Ok(reply.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_phrases() {
        let handler = KeywordHandler;
        assert_eq!(handler.reply("generate grass"), "Generating grass terrain...");
        assert_eq!(handler.reply("please build house now"), "Building house...");
    }

    #[test]
    fn matching_ignores_case() {
        assert_eq!(KeywordHandler.reply("Build House"), "Building house...");
        assert_eq!(
            KeywordHandler.reply("GENERATE GRASS here"),
            "Generating grass terrain..."
        );
    }

    #[test]
    fn first_phrase_wins() {
        assert_eq!(
            KeywordHandler.reply("build house then generate grass"),
            "Generating grass terrain..."
        );
    }

    #[test]
    fn anything_else_falls_back() {
        assert_eq!(KeywordHandler.reply("hello"), FALLBACK_REPLY);
        assert_eq!(KeywordHandler.reply("build a house"), FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn process_never_fails() {
        let reply = KeywordHandler.process("dig a hole".to_string()).await;
        assert_eq!(reply.unwrap(), FALLBACK_REPLY);
    }
}
