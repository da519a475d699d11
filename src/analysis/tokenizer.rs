use crate::analysis::porter::PorterTokenizer;
use crate::analysis::token::Token;
use crate::core::config::TokenizerSpec;
use crate::core::error::{Error, Result};
use unicode_segmentation::UnicodeSegmentation;

/// Callback-driven tokenizer contract. The sink receives each token with
/// its source byte range, so snippet generation can recover offsets by
/// re-tokenizing the stored text.
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str, sink: &mut dyn FnMut(Token<'_>) -> Result<()>) -> Result<()>;

    fn name(&self) -> &str;
}

/// Instantiate a tokenizer from its config binding.
pub fn create_tokenizer(spec: &TokenizerSpec) -> Result<Box<dyn Tokenizer>> {
    match spec.name.as_str() {
        "simple" => Ok(Box::new(SimpleTokenizer::default())),
        "porter" => Ok(Box::new(PorterTokenizer::default())),
        other => Err(Error::config(format!("unknown tokenizer: {}", other))),
    }
}

/// Standard Unicode word tokenizer with lowercasing.
#[derive(Clone)]
pub struct SimpleTokenizer {
    pub max_token_length: usize,
}

impl Default for SimpleTokenizer {
    fn default() -> Self {
        SimpleTokenizer {
            max_token_length: 255,
        }
    }
}

impl Tokenizer for SimpleTokenizer {
    fn tokenize(&self, text: &str, sink: &mut dyn FnMut(Token<'_>) -> Result<()>) -> Result<()> {
        let mut position = 0u32;
        for (start, word) in text.unicode_word_indices() {
            if word.len() > self.max_token_length {
                continue;
            }
            let end = start + word.len();
            if word.chars().any(|c| c.is_uppercase()) {
                let lowered = word.to_lowercase();
                sink(Token::new(&lowered, start, end, position))?;
            } else {
                sink(Token::new(word, start, end, position))?;
            }
            position += 1;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "simple"
    }
}

/// Collect `(text, position)` pairs; used when parsing query phrases.
pub fn tokenize_to_vec(tokenizer: &dyn Tokenizer, text: &str) -> Result<Vec<(String, u32)>> {
    let mut out = Vec::new();
    tokenizer.tokenize(text, &mut |t| {
        out.push((t.text.to_string(), t.position));
        Ok(())
    })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(text: &str) -> Vec<(String, usize, usize, u32)> {
        let mut out = Vec::new();
        SimpleTokenizer::default()
            .tokenize(text, &mut |t| {
                out.push((t.text.to_string(), t.start, t.end, t.position));
                Ok(())
            })
            .unwrap();
        out
    }

    #[test]
    fn test_simple_tokenizer() {
        let t = tokens("The quick  brown fox");
        assert_eq!(t.len(), 4);
        assert_eq!(t[0], ("the".to_string(), 0, 3, 0));
        assert_eq!(t[1], ("quick".to_string(), 4, 9, 1));
        assert_eq!(t[2], ("brown".to_string(), 11, 16, 2));
        assert_eq!(t[3], ("fox".to_string(), 17, 20, 3));
    }

    #[test]
    fn test_punctuation_and_empty() {
        assert!(tokens("").is_empty());
        assert!(tokens("  ...  ").is_empty());
        let t = tokens("don't stop");
        assert_eq!(t[0].0, "don't");
        assert_eq!(t[1].0, "stop");
    }

    #[test]
    fn test_offsets_recover_source_text() {
        let text = "Alpha, Beta; GAMMA";
        for (tok, start, end, _) in tokens(text) {
            assert_eq!(text[start..end].to_lowercase(), tok);
        }
    }

    #[test]
    fn test_create_by_name() {
        let spec = TokenizerSpec {
            name: "simple".to_string(),
            args: vec![],
        };
        assert_eq!(create_tokenizer(&spec).unwrap().name(), "simple");
        let spec = TokenizerSpec {
            name: "porter".to_string(),
            args: vec![],
        };
        assert_eq!(create_tokenizer(&spec).unwrap().name(), "porter");
        let spec = TokenizerSpec {
            name: "nope".to_string(),
            args: vec![],
        };
        assert!(create_tokenizer(&spec).is_err());
    }
}
