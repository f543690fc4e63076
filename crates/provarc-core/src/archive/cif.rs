//! # CIF-embedded Archives
//!
//! A TCOD CIF file can carry an importable archive as a list of embedded
//! files. Only the first data block is read. Its `_tcod_file_*` loop
//! describes each file:
//!
//! | tag                            | meaning                                   |
//! |--------------------------------|-------------------------------------------|
//! | `_tcod_file_name`              | path; only names under `aiida/` are used  |
//! | `_tcod_file_contents`          | inline contents, `?`/`.` if not inlined   |
//! | `_tcod_file_content_encoding`  | `base64`, `gzip+base64` or `.` (none)     |
//! | `_tcod_file_uri`               | where to fetch contents that are not inlined |
//! | `_tcod_file_md5sum`            | expected MD5 of the decoded contents      |
//! | `_tcod_file_sha1sum`           | expected SHA1 of the decoded contents     |

use super::extract::sanitize;
use crate::primitives::CIF_EMBEDDED_PREFIX;
use crate::types::ProvarcError;
use base64::Engine;
use flate2::read::GzDecoder;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

// =============================================================================
// REMOTE CONTENT
// =============================================================================

/// Fetches the contents of files a CIF references by URI.
pub trait RemoteFetcher {
    fn fetch(&self, uri: &str) -> Result<Vec<u8>, ProvarcError>;
}

/// [`RemoteFetcher`] over HTTP(S) using `ureq`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UreqFetcher;

impl RemoteFetcher for UreqFetcher {
    fn fetch(&self, uri: &str) -> Result<Vec<u8>, ProvarcError> {
        info!(uri, "fetching file referenced by CIF");
        let response = ureq::get(uri)
            .call()
            .map_err(|e| ProvarcError::Io(format!("{}: {}", uri, e)))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .map_err(|e| ProvarcError::Io(format!("{}: {}", uri, e)))?;
        Ok(bytes)
    }
}

// =============================================================================
// TOKENIZER
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    DataBlock(String),
    Loop,
    Tag(String),
    /// `None` for the unquoted placeholders `?` and `.`.
    Value(Option<String>),
}

fn classify_bare(word: &str) -> Token {
    let lower = word.to_ascii_lowercase();
    if let Some(name) = lower.strip_prefix("data_") {
        Token::DataBlock(name.to_string())
    } else if lower == "loop_" {
        Token::Loop
    } else if word.starts_with('_') {
        Token::Tag(lower)
    } else if word == "?" || word == "." {
        Token::Value(None)
    } else {
        Token::Value(Some(word.to_string()))
    }
}

fn tokenize_line(line: &str, tokens: &mut Vec<Token>) {
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '#' {
            return;
        } else if c == '\'' || c == '"' {
            // A quote closes only when followed by whitespace or end of line.
            let start = i + 1;
            let mut end = start;
            while end < chars.len()
                && !(chars[end] == c && chars.get(end + 1).is_none_or(|n| n.is_whitespace()))
            {
                end += 1;
            }
            tokens.push(Token::Value(Some(chars[start..end].iter().collect())));
            i = end + 1;
        } else {
            let start = i;
            while i < chars.len() && !chars[i].is_whitespace() {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            tokens.push(classify_bare(&word));
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, ProvarcError> {
    let mut tokens = Vec::new();
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        let Some(first) = line.strip_prefix(';') else {
            tokenize_line(line, &mut tokens);
            continue;
        };
        // Text field: runs until the next line starting with ';'.
        // An opening line holding only ';' contributes no content line.
        let mut body: Vec<&str> = Vec::new();
        if !first.trim().is_empty() {
            body.push(first);
        }
        let mut closing = None;
        for next in lines.by_ref() {
            if let Some(rest) = next.strip_prefix(';') {
                closing = Some(rest);
                break;
            }
            body.push(next);
        }
        let Some(rest) = closing else {
            return Err(ProvarcError::UnrecognizedArchiveFormat(
                "CIF text field is not terminated".to_string(),
            ));
        };
        tokens.push(Token::Value(Some(body.join("\n"))));
        tokenize_line(rest, &mut tokens);
    }
    Ok(tokens)
}

// =============================================================================
// DATA BLOCK
// =============================================================================

/// The tags of one CIF data block, each with its column of values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CifBlock {
    pub name: String,
    pub items: BTreeMap<String, Vec<Option<String>>>,
}

impl CifBlock {
    /// Values of a tag (case-insensitive), empty if the tag is absent.
    #[must_use]
    pub fn column(&self, tag: &str) -> &[Option<String>] {
        self.items
            .get(&tag.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Parse the first data block of a CIF document.
pub fn parse_first_block(text: &str) -> Result<CifBlock, ProvarcError> {
    let tokens = tokenize(text)?;
    let mut iter = tokens.into_iter().peekable();

    let name = loop {
        match iter.next() {
            Some(Token::DataBlock(name)) => break name,
            Some(_) => continue,
            None => {
                return Err(ProvarcError::UnrecognizedArchiveFormat(
                    "CIF file has no data block".to_string(),
                ));
            }
        }
    };

    let mut block = CifBlock {
        name,
        items: BTreeMap::new(),
    };
    while let Some(token) = iter.next() {
        match token {
            Token::DataBlock(_) => break,
            Token::Loop => {
                let mut tags = Vec::new();
                while let Some(Token::Tag(_)) = iter.peek() {
                    if let Some(Token::Tag(tag)) = iter.next() {
                        tags.push(tag);
                    }
                }
                let mut values = Vec::new();
                while let Some(Token::Value(_)) = iter.peek() {
                    if let Some(Token::Value(v)) = iter.next() {
                        values.push(v);
                    }
                }
                if tags.is_empty() || values.len() % tags.len() != 0 {
                    return Err(ProvarcError::UnrecognizedArchiveFormat(format!(
                        "CIF loop of {} tags holds {} values",
                        tags.len(),
                        values.len()
                    )));
                }
                for (i, value) in values.into_iter().enumerate() {
                    block
                        .items
                        .entry(tags[i % tags.len()].clone())
                        .or_default()
                        .push(value);
                }
            }
            Token::Tag(tag) => match iter.next() {
                Some(Token::Value(v)) => {
                    block.items.insert(tag, vec![v]);
                }
                _ => {
                    return Err(ProvarcError::UnrecognizedArchiveFormat(format!(
                        "CIF tag {} has no value",
                        tag
                    )));
                }
            },
            Token::Value(_) => {
                return Err(ProvarcError::UnrecognizedArchiveFormat(
                    "CIF value without a tag".to_string(),
                ));
            }
        }
    }
    Ok(block)
}

// =============================================================================
// EXTRACTION
// =============================================================================

fn decode_contents(contents: &[u8], encoding: Option<&str>) -> Result<Vec<u8>, ProvarcError> {
    let unwrap_base64 = |data: &[u8]| {
        let cleaned: Vec<u8> = data
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        base64::engine::general_purpose::STANDARD
            .decode(cleaned)
            .map_err(|e| ProvarcError::UnrecognizedArchiveFormat(format!("bad base64: {}", e)))
    };
    match encoding {
        None => Ok(contents.to_vec()),
        Some("base64") => unwrap_base64(contents),
        Some("gzip+base64") => {
            let compressed = unwrap_base64(contents)?;
            let mut out = Vec::new();
            GzDecoder::new(compressed.as_slice())
                .read_to_end(&mut out)
                .map_err(|e| ProvarcError::UnrecognizedArchiveFormat(format!("bad gzip: {}", e)))?;
            Ok(out)
        }
        Some(other) => Err(ProvarcError::UnrecognizedArchiveFormat(format!(
            "unsupported CIF content encoding '{}'",
            other
        ))),
    }
}

fn verify(
    file: &str,
    algorithm: &'static str,
    expected: Option<&String>,
    actual: String,
) -> Result<(), ProvarcError> {
    match expected {
        Some(expected) if !expected.eq_ignore_ascii_case(&actual) => {
            Err(ProvarcError::ChecksumMismatch {
                file: file.to_string(),
                algorithm,
                expected: expected.clone(),
                actual,
            })
        }
        _ => Ok(()),
    }
}

/// Extract the embedded archive of a TCOD CIF file into `dest`.
pub fn extract_cif(
    path: &Path,
    dest: &Path,
    fetcher: &dyn RemoteFetcher,
) -> Result<(), ProvarcError> {
    let text = fs::read_to_string(path)
        .map_err(|e| ProvarcError::Io(format!("{}: {}", path.display(), e)))?;
    let block = parse_first_block(&text)?;
    debug!(block = %block.name, "reading embedded files from CIF data block");

    let names = block.column("_tcod_file_name");
    let cell = |tag: &str, row: usize| block.column(tag).get(row).cloned().flatten();

    for (row, name) in names.iter().enumerate() {
        let Some(name) = name else { continue };
        let Some(inner) = name.strip_prefix(CIF_EMBEDDED_PREFIX) else {
            continue;
        };
        let rel = sanitize(Path::new(inner)).ok_or_else(|| {
            ProvarcError::UnrecognizedArchiveFormat(format!("unsafe path in CIF: {}", name))
        })?;
        let target = dest.join(&rel);

        if inner.ends_with('/') || inner.is_empty() {
            fs::create_dir_all(&target)
                .map_err(|e| ProvarcError::Io(format!("{}: {}", target.display(), e)))?;
            continue;
        }

        let raw = match cell("_tcod_file_contents", row) {
            Some(inline) => inline.into_bytes(),
            None => match cell("_tcod_file_uri", row) {
                Some(uri) => fetcher.fetch(&uri)?,
                None => return Err(ProvarcError::MissingArchiveMember(name.clone())),
            },
        };
        let encoding = cell("_tcod_file_content_encoding", row);
        let contents = decode_contents(&raw, encoding.as_deref())?;

        verify(
            inner,
            "MD5",
            cell("_tcod_file_md5sum", row).as_ref(),
            format!("{:x}", md5::compute(&contents)),
        )?;
        verify(
            inner,
            "SHA1",
            cell("_tcod_file_sha1sum", row).as_ref(),
            hex::encode(Sha1::digest(&contents)),
        )?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ProvarcError::Io(format!("{}: {}", parent.display(), e)))?;
        }
        fs::write(&target, &contents)
            .map_err(|e| ProvarcError::Io(format!("{}: {}", target.display(), e)))?;
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
