//! Pair → supervised sequence with a loss mask

use pairtune_core::{Result, TextTokenizer, TuneError};

use crate::dataset::TrainingPair;

/// Framing that precedes every target.
pub fn prompt_text(input: &str) -> String {
    format!("Input: {input}\nOutput:")
}

/// Prompt, a single space, the target, then the end-of-sequence marker.
pub fn full_text(input: &str, target: &str, eos_token: &str) -> String {
    format!("{} {target}{eos_token}", prompt_text(input))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedExample {
    pub token_ids: Vec<u32>,
    /// `true` only where the token belongs to the target or its eos.
    pub loss_mask: Vec<bool>,
}

impl EncodedExample {
    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    /// Number of supervised tokens.
    pub fn target_len(&self) -> usize {
        self.loss_mask.iter().filter(|m| **m).count()
    }
}

/// Encode one pair, truncated to `max_len` tokens.
///
/// The prompt length `P` is measured by encoding the prompt alone (also
/// truncated to `max_len`). Positions before `P` are masked out; when the
/// prompt fills the whole sequence nothing is supervised, and the example is
/// still returned.
pub fn build_example<T>(tokenizer: &T, pair: &TrainingPair, max_len: usize) -> Result<EncodedExample>
where
    T: TextTokenizer + ?Sized,
{
    if pair.input.trim().is_empty() || pair.target.trim().is_empty() {
        return Err(TuneError::MalformedRecord {
            line: pair.line,
            reason: "input and target must be non-empty".into(),
        });
    }

    let mut token_ids = tokenizer.encode(&full_text(&pair.input, &pair.target, tokenizer.eos_token()))?;
    token_ids.truncate(max_len);
    if token_ids.is_empty() {
        return Err(TuneError::Tokenize(format!("record at line {} produced no tokens", pair.line)));
    }

    let prompt_len = tokenizer.encode(&prompt_text(&pair.input))?.len().min(max_len);

    let loss_mask = if prompt_len < token_ids.len() {
        (0..token_ids.len()).map(|i| i >= prompt_len).collect()
    } else {
        vec![false; token_ids.len()]
    };

    Ok(EncodedExample { token_ids, loss_mask })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::Path;

    /// One id per byte, `<eos>` as 256, nothing added around the text.
    pub(crate) struct ByteTokenizer;

    impl TextTokenizer for ByteTokenizer {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            let mut ids = Vec::new();
            for (i, chunk) in text.split("<eos>").enumerate() {
                if i > 0 {
                    ids.push(256);
                }
                ids.extend(chunk.bytes().map(u32::from));
            }
            Ok(ids)
        }

        fn eos_token(&self) -> &str {
            "<eos>"
        }

        fn pad_token_id(&self) -> u32 {
            256
        }

        fn vocab_size(&self) -> usize {
            257
        }

        fn save(&self, _dir: &Path) -> Result<()> {
            Ok(())
        }
    }

    pub(crate) fn pair(input: &str, target: &str) -> TrainingPair {
        TrainingPair {
            input: input.into(),
            target: target.into(),
            line: 1,
            raw: String::new(),
        }
    }

    #[test]
    fn test_text_layout() {
        assert_eq!(prompt_text("2+2"), "Input: 2+2\nOutput:");
        assert_eq!(full_text("2+2", "4", "</s>"), "Input: 2+2\nOutput: 4</s>");
    }

    #[test]
    fn test_prompt_positions_are_masked() -> Result<()> {
        let example = build_example(&ByteTokenizer, &pair("hi", "yo"), 512)?;
        let prompt_len = prompt_text("hi").len();

        // prompt, space, two target bytes, eos
        assert_eq!(example.len(), prompt_len + 4);
        assert!(example.loss_mask[..prompt_len].iter().all(|m| !m));
        assert!(example.loss_mask[prompt_len..].iter().all(|m| *m));
        assert_eq!(*example.token_ids.last().unwrap(), 256);
        Ok(())
    }

    #[test]
    fn test_truncation_keeps_prefix() -> Result<()> {
        let prompt_len = prompt_text("hi").len();
        let max_len = prompt_len + 2;
        let example = build_example(&ByteTokenizer, &pair("hi", "a long answer"), max_len)?;

        assert_eq!(example.len(), max_len);
        assert_eq!(example.target_len(), 2);
        Ok(())
    }

    #[test]
    fn test_prompt_filling_budget_masks_everything() -> Result<()> {
        let prompt_len = prompt_text("a very long question").len();
        for max_len in [prompt_len, prompt_len - 3, 1] {
            let example = build_example(&ByteTokenizer, &pair("a very long question", "x"), max_len)?;
            assert_eq!(example.len(), max_len);
            assert_eq!(example.target_len(), 0);
        }
        Ok(())
    }

    #[test]
    fn test_blank_fields_are_malformed() {
        let err = build_example(&ByteTokenizer, &pair("q", " "), 64).unwrap_err();
        assert!(err.is_recoverable());
    }
}
