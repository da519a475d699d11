use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Hard limit on a leaf page: 128 KiB.
pub const MAX_PAGE_SIZE: usize = 128 * 1024;
/// Smallest page size that keeps the doclist-index machinery sane.
pub const MIN_PAGE_SIZE: usize = 64;
/// Prefix indexes may be declared for 1..=999 characters.
pub const MAX_PREFIX_CHARS: usize = 999;
/// At most this many prefix indexes per table.
pub const MAX_PREFIX_INDEXES: usize = 31;
/// Ceiling for the automerge directive. 0 disables, 1 selects the default.
pub const MAX_AUTOMERGE: usize = 64;

pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const DEFAULT_AUTOMERGE: usize = 4;
pub const DEFAULT_CRISIS_MERGE: usize = 16;
pub const DEFAULT_HASH_SIZE: usize = 1024 * 1024;

/// Rank function binding, e.g. `bm25()` or `bm25(1.2, 0.75)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankSpec {
    pub name: String,
    pub args: Vec<String>,
}

impl RankSpec {
    pub fn to_directive(&self) -> String {
        format!("{}({})", self.name, self.args.join(","))
    }
}

impl Default for RankSpec {
    fn default() -> Self {
        RankSpec {
            name: "bm25".to_string(),
            args: Vec::new(),
        }
    }
}

/// Tokenizer binding, e.g. `simple` or `porter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizerSpec {
    pub name: String,
    pub args: Vec<String>,
}

impl Default for TokenizerSpec {
    fn default() -> Self {
        TokenizerSpec {
            name: "simple".to_string(),
            args: Vec::new(),
        }
    }
}

/// Parsed table configuration.
///
/// The cookie is bumped whenever a persistent setting changes; the copy
/// stored at the head of the structure record must match it after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    pub columns: Vec<String>,
    /// Character counts of the declared prefix indexes, in declaration order.
    pub prefixes: Vec<usize>,
    pub tokenizer: TokenizerSpec,
    pub page_size: usize,
    pub automerge: usize,
    pub crisis_merge: usize,
    /// Pending-hash byte budget; a flush is forced once it is exceeded.
    pub hash_size: usize,
    pub rank: RankSpec,
    pub cookie: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            columns: Vec::new(),
            prefixes: Vec::new(),
            tokenizer: TokenizerSpec::default(),
            page_size: DEFAULT_PAGE_SIZE,
            automerge: DEFAULT_AUTOMERGE,
            crisis_merge: DEFAULT_CRISIS_MERGE,
            hash_size: DEFAULT_HASH_SIZE,
            rank: RankSpec::default(),
            cookie: 0,
        }
    }
}

impl IndexConfig {
    /// Parse CREATE-style arguments: bare identifiers are column names,
    /// `key=value` pairs are directives. Values may be single-quoted.
    pub fn parse(args: &[&str]) -> Result<IndexConfig> {
        let mut config = IndexConfig::default();

        for arg in args {
            let arg = arg.trim();
            if let Some(eq) = arg.find('=') {
                let key = arg[..eq].trim();
                let value = unquote(arg[eq + 1..].trim());
                config.apply_directive(key, value)?;
            } else {
                if arg.is_empty() {
                    return Err(Error::config("empty column name".to_string()));
                }
                if config.columns.iter().any(|c| c == arg) {
                    return Err(Error::config(format!("duplicate column name: {}", arg)));
                }
                config.columns.push(arg.to_string());
            }
        }

        if config.columns.is_empty() {
            return Err(Error::config("no columns defined".to_string()));
        }
        Ok(config)
    }

    fn apply_directive(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "prefix" => {
                for part in value.split(',') {
                    let n: usize = part
                        .trim()
                        .parse()
                        .map_err(|_| Error::config(format!("malformed prefix: {}", value)))?;
                    if n == 0 || n > MAX_PREFIX_CHARS {
                        return Err(Error::config(format!("prefix length out of range: {}", n)));
                    }
                    if !self.prefixes.contains(&n) {
                        self.prefixes.push(n);
                    }
                }
                if self.prefixes.len() > MAX_PREFIX_INDEXES {
                    return Err(Error::config("too many prefix indexes".to_string()));
                }
            }
            "tokenize" => {
                let mut parts = value.split_whitespace();
                let name = parts
                    .next()
                    .ok_or_else(|| Error::config("empty tokenize directive".to_string()))?;
                self.tokenizer = TokenizerSpec {
                    name: name.to_string(),
                    args: parts.map(String::from).collect(),
                };
            }
            "pgsz" => {
                self.page_size = parse_int(key, value)?;
                if self.page_size < MIN_PAGE_SIZE || self.page_size > MAX_PAGE_SIZE {
                    return Err(Error::config(format!("pgsz out of range: {}", value)));
                }
            }
            "automerge" => {
                let mut n: usize = parse_int(key, value)?;
                if n > MAX_AUTOMERGE {
                    return Err(Error::config(format!("automerge out of range: {}", value)));
                }
                if n == 1 {
                    n = DEFAULT_AUTOMERGE;
                }
                self.automerge = n;
            }
            "crisismerge" => {
                let n: usize = parse_int(key, value)?;
                self.crisis_merge = if n <= 1 { DEFAULT_CRISIS_MERGE } else { n };
            }
            "hashsize" => {
                self.hash_size = parse_int(key, value)?;
            }
            "rank" => {
                self.rank = parse_rank(value)?;
            }
            _ => {
                return Err(Error::config(format!("unrecognized directive: {}", key)));
            }
        }
        Ok(())
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Index number for a query prefix of `n` characters, if one is declared.
    pub fn prefix_index_for(&self, n: usize) -> Option<usize> {
        self.prefixes.iter().position(|&p| p == n).map(|i| i + 1)
    }

    pub fn bump_cookie(&mut self) {
        self.cookie = self.cookie.wrapping_add(1);
    }
}

/// Parse a `rank='name(arg, arg)'` value.
pub fn parse_rank(value: &str) -> Result<RankSpec> {
    let value = value.trim();
    let (name, rest) = match value.find('(') {
        Some(open) => {
            if !value.ends_with(')') {
                return Err(Error::config(format!("malformed rank: {}", value)));
            }
            (&value[..open], &value[open + 1..value.len() - 1])
        }
        None => (value, ""),
    };
    let name = name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::config(format!("malformed rank: {}", value)));
    }
    let args = rest
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    Ok(RankSpec {
        name: name.to_string(),
        args,
    })
}

fn parse_int(key: &str, value: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|_| Error::config(format!("malformed {}: {}", key, value)))
}

fn unquote(value: &str) -> &str {
    let v = value.trim();
    if v.len() >= 2 && (v.starts_with('\'') && v.ends_with('\'') || v.starts_with('"') && v.ends_with('"')) {
        &v[1..v.len() - 1]
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_columns_and_directives() {
        let config =
            IndexConfig::parse(&["title", "body", "prefix='2,3'", "tokenize=porter", "pgsz=64"])
                .unwrap();
        assert_eq!(config.columns, vec!["title", "body"]);
        assert_eq!(config.prefixes, vec![2, 3]);
        assert_eq!(config.tokenizer.name, "porter");
        assert_eq!(config.page_size, 64);
        assert_eq!(config.automerge, DEFAULT_AUTOMERGE);
        assert_eq!(config.crisis_merge, DEFAULT_CRISIS_MERGE);
    }

    #[test]
    fn test_prefix_index_lookup() {
        let config = IndexConfig::parse(&["a", "prefix=2,5"]).unwrap();
        assert_eq!(config.prefix_index_for(2), Some(1));
        assert_eq!(config.prefix_index_for(5), Some(2));
        assert_eq!(config.prefix_index_for(3), None);
    }

    #[test]
    fn test_automerge_one_selects_default() {
        let config = IndexConfig::parse(&["a", "automerge=1"]).unwrap();
        assert_eq!(config.automerge, DEFAULT_AUTOMERGE);
        let config = IndexConfig::parse(&["a", "automerge=0"]).unwrap();
        assert_eq!(config.automerge, 0);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(IndexConfig::parse(&[]).is_err());
        assert!(IndexConfig::parse(&["a", "a"]).is_err());
        assert!(IndexConfig::parse(&["a", "prefix=0"]).is_err());
        assert!(IndexConfig::parse(&["a", "prefix=1000"]).is_err());
        assert!(IndexConfig::parse(&["a", "pgsz=16"]).is_err());
        assert!(IndexConfig::parse(&["a", "automerge=65"]).is_err());
        assert!(IndexConfig::parse(&["a", "nonsense=1"]).is_err());
    }

    #[test]
    fn test_parse_rank() {
        let r = parse_rank("bm25(1.2, 0.75)").unwrap();
        assert_eq!(r.name, "bm25");
        assert_eq!(r.args, vec!["1.2", "0.75"]);
        let r = parse_rank("bm25").unwrap();
        assert!(r.args.is_empty());
        assert!(parse_rank("bm25(").is_err());
        assert!(parse_rank("").is_err());
    }
}
