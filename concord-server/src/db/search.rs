//! Full-text search over a channel's message history.
//!
//! Recall and ranking come from the FTS5 index (unicode61 tokenizer, bm25
//! rank). The query is treated as plain text: it is split on whitespace and
//! every token becomes a quoted prefix term, so FTS5 operators in user
//! input have no effect. Snippets are built over the raw content so the
//! matched substring itself is wrapped, not the whole token.

use rusqlite::{params, Result as SqlResult};
use serde::{Deserialize, Serialize};

use super::Db;

pub const DEFAULT_SEARCH_LIMIT: usize = 20;
pub const MAX_SEARCH_LIMIT: usize = 50;

/// How many words a snippet fragment may span.
const SNIPPET_WORDS: usize = 32;
/// Words of leading context before the matched word.
const SNIPPET_LEAD: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResultRow {
    pub message_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub content: String,
    pub kind: String,
    pub edited_at: Option<i64>,
    pub created_at: i64,
    pub author_handle: Option<String>,
    pub author_avatar: Option<String>,
    pub snippet: String,
}

impl Db {
    /// Ranked search within one channel. Returns at most `limit` results
    /// (clamped to 1..=50, default 20); never rows from other channels.
    pub fn search_messages(
        &self,
        channel_id: &str,
        query: &str,
        limit: usize,
    ) -> SqlResult<Vec<SearchResultRow>> {
        let limit = if limit == 0 {
            DEFAULT_SEARCH_LIMIT
        } else {
            limit.min(MAX_SEARCH_LIMIT)
        };
        let Some(match_expr) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let mut stmt = self.conn().prepare(
            "SELECT m.id, m.channel_id, m.author_id, m.content, m.kind, m.edited_at,
                    m.created_at, u.handle, u.avatar_url
             FROM messages_fts f
             JOIN messages m ON m.rowid = f.rowid
             LEFT JOIN users u ON u.id = m.author_id
             WHERE messages_fts MATCH ?1 AND m.channel_id = ?2
             ORDER BY rank
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![match_expr, channel_id, limit as i64], |row| {
            let content: String = row.get(3)?;
            Ok(SearchResultRow {
                message_id: row.get(0)?,
                channel_id: row.get(1)?,
                author_id: row.get(2)?,
                snippet: build_snippet(&content, query),
                content,
                kind: row.get(4)?,
                edited_at: row.get(5)?,
                created_at: row.get(6)?,
                author_handle: row.get(7)?,
                author_avatar: row.get(8)?,
            })
        })?;
        rows.collect()
    }
}

/// Turn plain text into an FTS5 match expression of quoted prefix terms.
/// Returns `None` when no usable token remains.
fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\"*"))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

/// Build a one-fragment snippet: up to 32 words around the first word that
/// matches a query token, with the matched prefix wrapped in `<mark>`.
fn build_snippet(content: &str, query: &str) -> String {
    let tokens: Vec<String> = query
        .split_whitespace()
        .map(str::to_lowercase)
        .filter(|t| !t.is_empty())
        .collect();
    let words: Vec<&str> = content.split_whitespace().collect();

    let hit = words.iter().enumerate().find_map(|(i, word)| {
        let lower = word.to_lowercase();
        tokens
            .iter()
            .find(|t| lower.starts_with(t.as_str()))
            .map(|t| (i, t.chars().count()))
    });

    match hit {
        Some((idx, prefix_chars)) => {
            let start = idx.saturating_sub(SNIPPET_LEAD);
            let end = (start + SNIPPET_WORDS).min(words.len());
            let mut out = Vec::with_capacity(end - start);
            for (i, word) in words[start..end].iter().enumerate() {
                if start + i == idx {
                    let split_at = word
                        .char_indices()
                        .nth(prefix_chars)
                        .map_or(word.len(), |(b, _)| b);
                    let (head, tail) = word.split_at(split_at);
                    out.push(format!("<mark>{head}</mark>{tail}"));
                } else {
                    out.push((*word).to_string());
                }
            }
            out.join(" ")
        }
        None => words
            .into_iter()
            .take(SNIPPET_WORDS)
            .collect::<Vec<_>>()
            .join(" "),
    }
}
