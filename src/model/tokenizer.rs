use std::path::Path;

use crate::error::ServiceError;

/// Token-level text codec used by the decode loop.
pub trait Tokenizer: Send + Sync {
    /// Encodes `text`, with `prefix` (if any) placed verbatim in front of it.
    fn encode(&self, text: &str, prefix: Option<&str>) -> Result<Vec<u32>, ServiceError>;

    /// Text fragment contributed by a single token.
    fn decode(&self, token_id: u32) -> Result<String, ServiceError>;

    /// Text for a run of tokens. Differs from joining [`decode`](Self::decode)
    /// results when a character spans several tokens.
    fn decode_sequence(&self, token_ids: &[u32]) -> Result<String, ServiceError> {
        token_ids.iter().map(|&id| self.decode(id)).collect()
    }

    fn is_end_of_text(&self, token_id: u32) -> bool;
}

/// Special tokens looked up when no end-of-text ids are configured.
const END_OF_TEXT_TOKENS: &[&str] = &[
    "</s>",
    "<|endoftext|>",
    "<|end_of_text|>",
    "<|eot_id|>",
    "<|im_end|>",
    "<eos>",
];

/// SentencePiece word-boundary marker.
const METASPACE: char = '\u{2581}';

/// Adapter over a HuggingFace `tokenizer.json`.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    end_of_text: Vec<u32>,
}

impl HfTokenizer {
    pub fn from_file(path: &Path, end_of_text: Option<Vec<u32>>) -> Result<Self, ServiceError> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| ServiceError::Tokenizer(format!("{}: {e}", path.display())))?;
        Self::new(inner, end_of_text)
    }

    pub fn new(
        inner: tokenizers::Tokenizer,
        end_of_text: Option<Vec<u32>>,
    ) -> Result<Self, ServiceError> {
        let end_of_text = match end_of_text {
            Some(ids) if !ids.is_empty() => ids,
            _ => END_OF_TEXT_TOKENS
                .iter()
                .filter_map(|token| inner.token_to_id(token))
                .collect(),
        };
        if end_of_text.is_empty() {
            return Err(ServiceError::Configuration(
                "tokenizer defines no end-of-text token; set EOS_TOKEN_IDS".into(),
            ));
        }
        Ok(Self { inner, end_of_text })
    }

    pub fn end_of_text_ids(&self) -> &[u32] {
        &self.end_of_text
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str, prefix: Option<&str>) -> Result<Vec<u32>, ServiceError> {
        let input = match prefix {
            Some(prefix) => format!("{prefix}{text}"),
            None => text.to_string(),
        };
        let encoding = self
            .inner
            .encode(input, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, token_id: u32) -> Result<String, ServiceError> {
        let text = self
            .inner
            .decode(&[token_id], true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;

        // Metaspace decoders strip the leading space of a lone word piece.
        let starts_word = self
            .inner
            .id_to_token(token_id)
            .is_some_and(|piece| piece.starts_with(METASPACE));
        if starts_word && !text.starts_with(' ') {
            Ok(format!(" {text}"))
        } else {
            Ok(text)
        }
    }

    fn decode_sequence(&self, token_ids: &[u32]) -> Result<String, ServiceError> {
        self.inner
            .decode(token_ids, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))
    }

    fn is_end_of_text(&self, token_id: u32) -> bool {
        self.end_of_text.contains(&token_id)
    }
}
