use crate::analysis::tokenizer::{tokenize_to_vec, Tokenizer};
use crate::core::error::{Error, Result};

/// One term of a phrase; `prefix` marks a trailing `*`.
#[derive(Debug, Clone, PartialEq)]
pub struct PhraseTerm {
    pub text: String,
    pub prefix: bool,
}

/// A phrase: adjacent terms that must occur consecutively.
#[derive(Debug, Clone, PartialEq)]
pub struct Phrase {
    pub terms: Vec<PhraseTerm>,
}

/// Boolean structure over phrases. Leaves index into `Query::phrases`.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Phrase(usize),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub expr: Expr,
    pub phrases: Vec<Phrase>,
}

#[derive(Debug, Clone, PartialEq)]
enum Lexeme {
    Word(String, bool),
    Quoted(String, bool),
    Open,
    Close,
    And,
    Or,
    Not,
}

/// Hand-rolled MATCH parser. Grammar, loosest binding first:
///
/// ```text
///   or   := and (OR and)*
///   and  := not (AND? not)*          juxtaposition is AND
///   not  := prim (NOT prim)*
///   prim := '(' or ')' | '"' text '"' ['*'] | word ['*']
/// ```
///
/// Query terms are run through the table's tokenizer, so a hyphenated
/// word becomes an implicit phrase the same way it was indexed.
pub struct QueryParser;

impl QueryParser {
    pub fn parse(tokenizer: &dyn Tokenizer, input: &str) -> Result<Query> {
        let lexemes = lex(input)?;
        let mut p = Parser {
            lexemes,
            i: 0,
            tokenizer,
            phrases: Vec::new(),
        };
        if p.lexemes.is_empty() {
            return Err(Error::query("empty match expression".to_string()));
        }
        let expr = p.parse_or()?;
        if p.i != p.lexemes.len() {
            return Err(Error::query("trailing tokens in match expression".to_string()));
        }
        Ok(Query {
            expr,
            phrases: p.phrases,
        })
    }
}

struct Parser<'a> {
    lexemes: Vec<Lexeme>,
    i: usize,
    tokenizer: &'a dyn Tokenizer,
    phrases: Vec<Phrase>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Lexeme> {
        self.lexemes.get(self.i)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut items = vec![self.parse_and()?];
        while self.peek() == Some(&Lexeme::Or) {
            self.i += 1;
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 {
            items.pop().unwrap()
        } else {
            Expr::Or(items)
        })
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut items = vec![self.parse_not()?];
        loop {
            match self.peek() {
                Some(Lexeme::And) => {
                    self.i += 1;
                    items.push(self.parse_not()?);
                }
                Some(Lexeme::Word(..)) | Some(Lexeme::Quoted(..)) | Some(Lexeme::Open) => {
                    items.push(self.parse_not()?);
                }
                _ => break,
            }
        }
        Ok(if items.len() == 1 {
            items.pop().unwrap()
        } else {
            Expr::And(items)
        })
    }

    fn parse_not(&mut self) -> Result<Expr> {
        let mut left = self.parse_primary()?;
        while self.peek() == Some(&Lexeme::Not) {
            self.i += 1;
            let right = self.parse_primary()?;
            left = Expr::Not(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.peek().cloned() {
            Some(Lexeme::Open) => {
                self.i += 1;
                let inner = self.parse_or()?;
                if self.peek() != Some(&Lexeme::Close) {
                    return Err(Error::query("unbalanced parentheses".to_string()));
                }
                self.i += 1;
                Ok(inner)
            }
            Some(Lexeme::Word(text, star)) | Some(Lexeme::Quoted(text, star)) => {
                self.i += 1;
                self.add_phrase(&text, star)
            }
            _ => Err(Error::query("expected a term or phrase".to_string())),
        }
    }

    fn add_phrase(&mut self, text: &str, prefix: bool) -> Result<Expr> {
        let tokens = tokenize_to_vec(self.tokenizer, text)?;
        if tokens.is_empty() {
            return Err(Error::query(format!("no tokens in phrase: {:?}", text)));
        }
        let n = tokens.len();
        let terms = tokens
            .into_iter()
            .enumerate()
            .map(|(i, (t, _))| PhraseTerm {
                text: t,
                prefix: prefix && i + 1 == n,
            })
            .collect();
        self.phrases.push(Phrase { terms });
        Ok(Expr::Phrase(self.phrases.len() - 1))
    }
}

fn lex(input: &str) -> Result<Vec<Lexeme>> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < input.len() {
        let c = input[i..].chars().next().unwrap();
        if c.is_whitespace() {
            i += c.len_utf8();
            continue;
        }
        match c {
            '(' => {
                out.push(Lexeme::Open);
                i += 1;
            }
            ')' => {
                out.push(Lexeme::Close);
                i += 1;
            }
            '"' => {
                let start = i + 1;
                let end = input[start..]
                    .find('"')
                    .map(|p| start + p)
                    .ok_or_else(|| Error::query("unterminated quoted phrase".to_string()))?;
                let mut star = false;
                i = end + 1;
                if input.as_bytes().get(i) == Some(&b'*') {
                    star = true;
                    i += 1;
                }
                out.push(Lexeme::Quoted(input[start..end].to_string(), star));
            }
            _ => {
                let start = i;
                for (off, c) in input[start..].char_indices() {
                    i = start + off;
                    if c.is_whitespace() || c == '(' || c == ')' || c == '"' {
                        break;
                    }
                    i = start + off + c.len_utf8();
                }
                let mut word = &input[start..i];
                let mut star = false;
                if let Some(stripped) = word.strip_suffix('*') {
                    word = stripped;
                    star = true;
                }
                match word {
                    "AND" => out.push(Lexeme::And),
                    "OR" => out.push(Lexeme::Or),
                    "NOT" => out.push(Lexeme::Not),
                    "" => {
                        return Err(Error::query("dangling '*'".to_string()));
                    }
                    _ => out.push(Lexeme::Word(word.to_string(), star)),
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::tokenizer::SimpleTokenizer;

    fn parse(input: &str) -> Result<Query> {
        QueryParser::parse(&SimpleTokenizer::default(), input)
    }

    #[test]
    fn test_single_term() {
        let q = parse("Quick").unwrap();
        assert_eq!(q.phrases.len(), 1);
        assert_eq!(q.phrases[0].terms[0].text, "quick");
        assert!(!q.phrases[0].terms[0].prefix);
        assert_eq!(q.expr, Expr::Phrase(0));
    }

    #[test]
    fn test_implicit_and_and_or() {
        let q = parse("quick brown OR fox").unwrap();
        // (quick AND brown) OR fox
        match &q.expr {
            Expr::Or(items) => {
                assert_eq!(items.len(), 2);
                assert!(matches!(items[0], Expr::And(_)));
                assert!(matches!(items[1], Expr::Phrase(2)));
            }
            other => panic!("unexpected expr: {:?}", other),
        }
    }

    #[test]
    fn test_not_and_parens() {
        let q = parse("(a OR b) NOT c").unwrap();
        match &q.expr {
            Expr::Not(left, right) => {
                assert!(matches!(**left, Expr::Or(_)));
                assert!(matches!(**right, Expr::Phrase(2)));
            }
            other => panic!("unexpected expr: {:?}", other),
        }
    }

    #[test]
    fn test_quoted_phrase_and_prefix() {
        let q = parse("\"quick brown\" al*").unwrap();
        assert_eq!(q.phrases.len(), 2);
        assert_eq!(q.phrases[0].terms.len(), 2);
        assert!(q.phrases[1].terms[0].prefix);
    }

    #[test]
    fn test_word_splitting_makes_phrase() {
        let q = parse("foo-bar").unwrap();
        assert_eq!(q.phrases[0].terms.len(), 2);
        assert_eq!(q.phrases[0].terms[0].text, "foo");
        assert_eq!(q.phrases[0].terms[1].text, "bar");
    }

    #[test]
    fn test_errors() {
        assert!(parse("").is_err());
        assert!(parse("(a OR").is_err());
        assert!(parse("\"unterminated").is_err());
        assert!(parse("*").is_err());
        assert!(parse("a )").is_err());
    }
}
