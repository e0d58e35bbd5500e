/// Statement classification for read/write routing
///
/// A lightweight keyword scan, not a parser: comments, string literals and
/// quoted identifiers are skipped, the remaining words are upper-cased and
/// inspected.
use aho_corasick::AhoCorasick;
use lazy_static::lazy_static;

/// Where a statement is allowed to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// May run on a replica
    Read,
    /// Modifies data or schema
    Write,
    /// Reads that still need the primary (row locks, data-modifying CTEs)
    RequiresPrimary,
}

impl StatementKind {
    pub fn needs_primary(&self) -> bool {
        !matches!(self, StatementKind::Read)
    }
}

const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "CREATE", "ALTER", "DROP", "TRUNCATE", "MERGE", "UPSERT",
    "REPLACE", "GRANT", "REVOKE",
];

/// Keywords that make a `WITH` statement data-modifying
const CTE_WRITE_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE", "MERGE"];

const LOCKING_CLAUSES: &[&str] = &["FOR UPDATE", "FOR NO KEY UPDATE", "FOR SHARE", "FOR KEY SHARE"];

lazy_static! {
    static ref LOCK_FINDER: AhoCorasick =
        AhoCorasick::new(LOCKING_CLAUSES).expect("Failed to create locking clause finder");
}

/// Classify a statement by its keywords
pub fn classify(sql: &str) -> StatementKind {
    let words = keywords(sql);
    let first = match words.first() {
        Some(word) => word.as_str(),
        None => return StatementKind::Read,
    };

    if WRITE_KEYWORDS.contains(&first) {
        return StatementKind::Write;
    }

    if first == "WITH"
        && words[1..]
            .iter()
            .any(|w| CTE_WRITE_KEYWORDS.contains(&w.as_str()))
    {
        return StatementKind::RequiresPrimary;
    }

    if has_locking_clause(&words.join(" ")) {
        return StatementKind::RequiresPrimary;
    }

    StatementKind::Read
}

/// Whether a whole-word locking clause occurs in space-joined keywords
fn has_locking_clause(joined: &str) -> bool {
    let bytes = joined.as_bytes();
    LOCK_FINDER.find_iter(joined).any(|m| {
        let starts_word = m.start() == 0 || bytes[m.start() - 1] == b' ';
        let ends_word = m.end() == bytes.len() || bytes[m.end()] == b' ';
        starts_word && ends_word
    })
}

/// Upper-cased bare words of `sql`, skipping comments, literals and quoted
/// identifiers
fn keywords(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut words = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if c == '-' && next == Some('-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && next == Some('*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i += 2;
        } else if c == '\'' || c == '"' || c == '`' {
            i = skip_quoted(&chars, i, c);
        } else if c == '$' {
            i = skip_dollar_quoted(&chars, i);
        } else if c.is_alphanumeric() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            words.push(chars[start..i].iter().collect::<String>().to_uppercase());
        } else {
            i += 1;
        }
    }

    words
}

/// Index just past a quoted section; a doubled quote is an escape
fn skip_quoted(chars: &[char], start: usize, quote: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    i
}

/// Index just past a `$tag$ ... $tag$` body or a `$n` parameter
fn skip_dollar_quoted(chars: &[char], start: usize) -> usize {
    let mut i = start + 1;
    if chars.get(i).map_or(false, |c| c.is_ascii_digit()) {
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
        return i;
    }

    while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
        i += 1;
    }
    if chars.get(i) != Some(&'$') {
        return i;
    }

    let tag = &chars[start..=i];
    let mut j = i + 1;
    while j + tag.len() <= chars.len() {
        if &chars[j..j + tag.len()] == tag {
            return j + tag.len();
        }
        j += 1;
    }
    chars.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_keywords() {
        for sql in [
            "INSERT INTO users VALUES (1)",
            "update users set name = 'x'",
            "  DELETE FROM users",
            "CREATE TABLE t (id int)",
            "ALTER TABLE t ADD COLUMN c int",
            "DROP TABLE t",
            "TRUNCATE t",
            "MERGE INTO t USING s ON t.id = s.id WHEN MATCHED THEN DELETE",
        ] {
            assert_eq!(classify(sql), StatementKind::Write, "{}", sql);
        }
    }

    #[test]
    fn test_reads() {
        for sql in [
            "SELECT * FROM users",
            "select 1",
            "SHOW search_path",
            "EXPLAIN SELECT * FROM users",
            "",
            "   ",
        ] {
            assert_eq!(classify(sql), StatementKind::Read, "{}", sql);
        }
    }

    #[test]
    fn test_leading_comments_are_ignored() {
        assert_eq!(
            classify("-- audit\nINSERT INTO log VALUES (1)"),
            StatementKind::Write
        );
        assert_eq!(
            classify("/* hint */ UPDATE users SET a = 1"),
            StatementKind::Write
        );
        assert_eq!(
            classify("SELECT 1 /* DELETE FROM users */"),
            StatementKind::Read
        );
    }

    #[test]
    fn test_locking_reads_need_primary() {
        assert_eq!(
            classify("SELECT * FROM jobs WHERE id = $1 FOR UPDATE"),
            StatementKind::RequiresPrimary
        );
        assert_eq!(
            classify("select * from jobs for share skip locked"),
            StatementKind::RequiresPrimary
        );
        assert_eq!(
            classify("SELECT * FROM t FOR NO KEY UPDATE"),
            StatementKind::RequiresPrimary
        );
        assert_eq!(
            classify("SELECT * FROM t\n  FOR\tUPDATE NOWAIT"),
            StatementKind::RequiresPrimary
        );
    }

    #[test]
    fn test_literals_do_not_trigger_locking() {
        assert_eq!(
            classify("SELECT 'for update' AS label"),
            StatementKind::Read
        );
        assert_eq!(
            classify("SELECT \"for share\" FROM t"),
            StatementKind::Read
        );
        assert_eq!(
            classify("SELECT $$ FOR UPDATE $$"),
            StatementKind::Read
        );
        assert_eq!(classify("SELECT * FROM formats"), StatementKind::Read);
    }

    #[test]
    fn test_data_modifying_cte() {
        assert_eq!(
            classify(
                "WITH moved AS (DELETE FROM queue RETURNING *) INSERT INTO archive SELECT * FROM moved"
            ),
            StatementKind::RequiresPrimary
        );
        assert_eq!(
            classify("WITH recent AS (SELECT * FROM events) SELECT count(*) FROM recent"),
            StatementKind::Read
        );
    }

    #[test]
    fn test_escaped_quotes() {
        assert_eq!(
            classify("SELECT 'it''s FOR UPDATE' FROM t"),
            StatementKind::Read
        );
        assert!(StatementKind::Write.needs_primary());
        assert!(!StatementKind::Read.needs_primary());
    }
}
