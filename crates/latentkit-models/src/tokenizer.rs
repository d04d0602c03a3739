//! Prompt tokenizer over the BPE assets shipped with a model.
//!
//! The tokenizer itself is an opaque collaborator; this wrapper only owns the
//! framing contract: start/end tokens, padding with the end token, and silent
//! (logged) truncation beyond the model's sequence length.

use std::collections::HashMap;
use std::path::Path;

use tokenizers::models::bpe::BPE;
use tokenizers::pre_tokenizers::whitespace::Whitespace;
use tokenizers::Tokenizer;
use tracing::warn;

use crate::error::ModelError;

pub const START_OF_TEXT: &str = "<|startoftext|>";
pub const END_OF_TEXT: &str = "<|endoftext|>";

pub struct PromptTokenizer {
    tokenizer: Tokenizer,
    start_token: u32,
    end_token: u32,
}

impl PromptTokenizer {
    /// Build from the `vocab.json` + `merges.txt` pair of a resource
    /// directory.
    pub fn from_files(vocab: &Path, merges: &Path) -> Result<Self, ModelError> {
        let model = BPE::from_file(&vocab.to_string_lossy(), &merges.to_string_lossy())
            .end_of_word_suffix("</w>".into())
            .unk_token(END_OF_TEXT.into())
            .build()
            .map_err(|err| ModelError::TokenizationFailed(err.to_string()))?;
        Self::from_model(model)
    }

    /// Build from in-memory vocabulary and merge pairs.
    pub fn from_parts(
        vocab: HashMap<String, u32>,
        merges: Vec<(String, String)>,
    ) -> Result<Self, ModelError> {
        let vocab: tokenizers::models::bpe::Vocab = vocab.into_iter().collect();
        let model = BPE::builder()
            .vocab_and_merges(vocab, merges)
            .end_of_word_suffix("</w>".into())
            .unk_token(END_OF_TEXT.into())
            .build()
            .map_err(|err| ModelError::TokenizationFailed(err.to_string()))?;
        Self::from_model(model)
    }

    fn from_model(model: BPE) -> Result<Self, ModelError> {
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace {}));
        let start_token = tokenizer.token_to_id(START_OF_TEXT).ok_or_else(|| {
            ModelError::TokenizationFailed(format!("vocabulary is missing {START_OF_TEXT}"))
        })?;
        let end_token = tokenizer.token_to_id(END_OF_TEXT).ok_or_else(|| {
            ModelError::TokenizationFailed(format!("vocabulary is missing {END_OF_TEXT}"))
        })?;
        Ok(Self {
            tokenizer,
            start_token,
            end_token,
        })
    }

    /// Token ids bracketed by start/end tokens, padded or truncated to
    /// exactly `length`. Only the truncated prefix embeds.
    pub fn encode(&self, text: &str, length: usize) -> Result<Vec<u32>, ModelError> {
        if length < 2 {
            return Err(ModelError::TokenizationFailed(format!(
                "sequence length {length} cannot hold the start/end tokens"
            )));
        }
        let encoding = self
            .tokenizer
            .encode(text.to_lowercase(), false)
            .map_err(|err| ModelError::TokenizationFailed(err.to_string()))?;

        let mut ids = Vec::with_capacity(length);
        ids.push(self.start_token);
        ids.extend_from_slice(encoding.get_ids());
        if ids.len() > length - 1 {
            warn!(
                tokens = encoding.get_ids().len(),
                limit = length,
                "prompt exceeds the token limit and was truncated"
            );
            ids.truncate(length - 1);
        }
        ids.resize(length, self.end_token);
        Ok(ids)
    }
}
