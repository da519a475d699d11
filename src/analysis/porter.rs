use crate::analysis::token::Token;
use crate::analysis::tokenizer::{SimpleTokenizer, Tokenizer};
use crate::core::error::Result;
use rust_stemmers::{Algorithm, Stemmer};

/// Porter-stemming tokenizer: the simple tokenizer followed by an English
/// stemmer. Byte ranges stay those of the unstemmed source word.
#[derive(Clone, Default)]
pub struct PorterTokenizer {
    pub inner: SimpleTokenizer,
}

impl Tokenizer for PorterTokenizer {
    fn tokenize(&self, text: &str, sink: &mut dyn FnMut(Token<'_>) -> Result<()>) -> Result<()> {
        let stemmer = Stemmer::create(Algorithm::English);
        self.inner.tokenize(text, &mut |t| {
            let stemmed = stemmer.stem(t.text);
            sink(Token::new(&stemmed, t.start, t.end, t.position))
        })
    }

    fn name(&self) -> &str {
        "porter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(text: &str) -> Vec<(String, usize, usize)> {
        let mut out = Vec::new();
        PorterTokenizer::default()
            .tokenize(text, &mut |t| {
                out.push((t.text.to_string(), t.start, t.end));
                Ok(())
            })
            .unwrap();
        out
    }

    #[test]
    fn test_stemming() {
        let t = tokens("running runs ran");
        assert_eq!(t[0].0, "run");
        assert_eq!(t[1].0, "run");
        assert_eq!(t[2].0, "ran");
    }

    #[test]
    fn test_offsets_are_unstemmed() {
        let text = "connections";
        let t = tokens(text);
        assert_eq!(t[0].1, 0);
        assert_eq!(t[0].2, text.len());
    }
}
