//! Pattern-based SQL policy screening.
//!
//! Fixed evaluation order, short-circuiting on the first violation: basic
//! well-formedness, critical denylist, protected namespaces, injection
//! heuristics, dangerous functions, tier verb check, tier pattern list,
//! schema/table allow-list, size limit, structural limits. This is explicit
//! rule enforcement, not semantic SQL analysis.

use crate::policy::RestrictionProfile;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Severity attached to each named rule. Carried into audit records
/// verbatim instead of being re-derived from the rejection text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// One rejected query: which rule fired, why, and how severe it is.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub rule: &'static str,
    pub reason: String,
    pub severity: Severity,
}

impl Violation {
    fn new(rule: &'static str, severity: Severity, reason: impl Into<String>) -> Self {
        Self {
            rule,
            reason: reason.into(),
            severity,
        }
    }
}

fn regexes(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect()
}

// Absolute system-destructive operations. Denied for every tier, admin
// included.
static CRITICAL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    regexes(&[
        r"(?i)DROP\s+DATABASE",
        r"(?i)DROP\s+SCHEMA",
        r"(?i)ALTER\s+SYSTEM",
        r"(?i)CREATE\s+EXTENSION",
        r"(?i)pg_terminate_backend",
        r"(?i)pg_cancel_backend",
        r"(?i)DELETE\s+FROM\s+pg_",
        r"(?i)UPDATE\s+pg_",
        r"(?i)COPY\s+.*\s+FROM\s+PROGRAM",
        r"\\\\",
        r"(?i)xp_cmdshell",
        r"(?i)sp_configure",
    ])
});

// Mutations against the reserved auth/storage/realtime namespaces.
static PROTECTED_NAMESPACE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    regexes(&[
        r"(?i)DELETE\s+FROM\s+auth\.",
        r"(?i)TRUNCATE\s+auth\.",
        r"(?i)DROP\s+TABLE\s+auth\.",
        r"(?i)ALTER\s+TABLE\s+auth\.users",
        r"(?i)DELETE\s+FROM\s+storage\.",
        r"(?i)TRUNCATE\s+storage\.",
        r"(?i)DELETE\s+FROM\s+realtime\.",
    ])
});

// Statement stacking, tautologies, comment truncation, metadata probing.
static INJECTION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    regexes(&[
        r"(?i);\s*DROP",
        r"(?i);\s*DELETE",
        r"(?i);\s*UPDATE",
        r"(?i)UNION\s+SELECT.*FROM\s+information_schema",
        r"1=1",
        r"(?i)'.*OR.*'.*=.*'",
        r"(?i)--.*password",
        r"/\*.*\*/",
    ])
});

// File I/O, host program execution and cross-database links.
static DANGEROUS_FUNCTIONS: Lazy<Vec<Regex>> = Lazy::new(|| {
    regexes(&[
        r"(?i)pg_read_file",
        r"(?i)pg_write_file",
        r"(?i)pg_execute_server_program",
        r"(?i)lo_import",
        r"(?i)lo_export",
        r"(?i)dblink",
        r"(?i)pg_stat_file",
    ])
});

// Table references in statement positions: FROM/JOIN/UPDATE/INSERT INTO/
// DELETE FROM/CREATE|ALTER|DROP TABLE.
static TABLE_REF_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    regexes(&[
        r"(?i)FROM\s+([A-Za-z_]\w*(?:\.[A-Za-z_]\w*)?)",
        r"(?i)JOIN\s+([A-Za-z_]\w*(?:\.[A-Za-z_]\w*)?)",
        r"(?i)UPDATE\s+([A-Za-z_]\w*(?:\.[A-Za-z_]\w*)?)",
        r"(?i)INSERT\s+INTO\s+([A-Za-z_]\w*(?:\.[A-Za-z_]\w*)?)",
        r"(?i)DELETE\s+FROM\s+([A-Za-z_]\w*(?:\.[A-Za-z_]\w*)?)",
        r"(?i)CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?([A-Za-z_]\w*(?:\.[A-Za-z_]\w*)?)",
        r"(?i)ALTER\s+TABLE\s+([A-Za-z_]\w*(?:\.[A-Za-z_]\w*)?)",
        r"(?i)DROP\s+TABLE\s+(?:IF\s+EXISTS\s+)?([A-Za-z_]\w*(?:\.[A-Za-z_]\w*)?)",
    ])
});

static SUBQUERY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\(\s*SELECT").unwrap());
static JOIN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\s+JOIN\s+").unwrap());

/// Primary verb classification of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Select,
    Insert,
    Update,
    Delete,
    CreateTable,
    AlterTable,
    DropTable,
    CreateIndex,
    Create,
    Alter,
    Drop,
    Truncate,
    Unknown,
}

impl QueryKind {
    pub fn classify(query: &str) -> Self {
        let trimmed = query.trim_start().to_uppercase();
        if trimmed.starts_with("SELECT") {
            QueryKind::Select
        } else if trimmed.starts_with("INSERT") {
            QueryKind::Insert
        } else if trimmed.starts_with("UPDATE") {
            QueryKind::Update
        } else if trimmed.starts_with("DELETE") {
            QueryKind::Delete
        } else if trimmed.starts_with("CREATE TABLE") {
            QueryKind::CreateTable
        } else if trimmed.starts_with("ALTER TABLE") {
            QueryKind::AlterTable
        } else if trimmed.starts_with("DROP TABLE") {
            QueryKind::DropTable
        } else if trimmed.starts_with("CREATE INDEX") {
            QueryKind::CreateIndex
        } else if trimmed.starts_with("CREATE") {
            QueryKind::Create
        } else if trimmed.starts_with("ALTER") {
            QueryKind::Alter
        } else if trimmed.starts_with("DROP") {
            QueryKind::Drop
        } else if trimmed.starts_with("TRUNCATE") {
            QueryKind::Truncate
        } else {
            QueryKind::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Select => "SELECT",
            QueryKind::Insert => "INSERT",
            QueryKind::Update => "UPDATE",
            QueryKind::Delete => "DELETE",
            QueryKind::CreateTable => "CREATE TABLE",
            QueryKind::AlterTable => "ALTER TABLE",
            QueryKind::DropTable => "DROP TABLE",
            QueryKind::CreateIndex => "CREATE INDEX",
            QueryKind::Create => "CREATE",
            QueryKind::Alter => "ALTER",
            QueryKind::Drop => "DROP",
            QueryKind::Truncate => "TRUNCATE",
            QueryKind::Unknown => "UNKNOWN",
        }
    }
}

/// Screen one query against a tier's restriction profile. Returns the first
/// violation in rule order; the checker fails closed.
pub fn check(query: &str, profile: &RestrictionProfile) -> Result<(), Violation> {
    check_well_formed(query)?;
    check_pattern_table(
        query,
        &CRITICAL_PATTERNS,
        "critical_operation",
        Severity::Critical,
        "query contains a blocked critical operation",
    )?;
    check_pattern_table(
        query,
        &PROTECTED_NAMESPACE_PATTERNS,
        "protected_namespace",
        Severity::High,
        "query mutates a protected system namespace",
    )?;
    check_pattern_table(
        query,
        &INJECTION_PATTERNS,
        "injection_heuristic",
        Severity::High,
        "query matches an injection heuristic",
    )?;
    check_pattern_table(
        query,
        &DANGEROUS_FUNCTIONS,
        "dangerous_function",
        Severity::High,
        "query invokes a blocked function",
    )?;
    check_operation(query, profile)?;
    check_tier_patterns(query, profile)?;
    check_table_access(query, profile)?;
    check_size(query, profile.max_query_size)?;
    check_structure(query)
}

fn check_well_formed(query: &str) -> Result<(), Violation> {
    if query.trim().is_empty() {
        return Err(Violation::new(
            "well_formedness",
            Severity::Low,
            "query is empty",
        ));
    }
    if query.contains('\0') || query.contains('\u{1a}') {
        return Err(Violation::new(
            "well_formedness",
            Severity::Medium,
            "query contains control bytes",
        ));
    }
    Ok(())
}

fn check_pattern_table(
    query: &str,
    table: &[Regex],
    rule: &'static str,
    severity: Severity,
    what: &str,
) -> Result<(), Violation> {
    for pattern in table {
        if pattern.is_match(query) {
            return Err(Violation::new(
                rule,
                severity,
                format!("{what}: {}", pattern.as_str()),
            ));
        }
    }
    Ok(())
}

fn check_operation(query: &str, profile: &RestrictionProfile) -> Result<(), Violation> {
    let kind = QueryKind::classify(query);
    if !profile.allows_operation(kind.as_str()) {
        return Err(Violation::new(
            "operation_not_allowed",
            Severity::Medium,
            format!("operation {} not permitted at this tier", kind.as_str()),
        ));
    }
    Ok(())
}

fn check_tier_patterns(query: &str, profile: &RestrictionProfile) -> Result<(), Violation> {
    for pattern in profile.blocked_patterns {
        let re = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(pattern)))
            .expect("escaped pattern");
        if re.is_match(query) {
            return Err(Violation::new(
                "tier_blocked_pattern",
                Severity::Medium,
                format!("query contains blocked pattern: {pattern}"),
            ));
        }
    }
    Ok(())
}

/// Extract table references from statement positions, lowercased.
fn extract_table_refs(query: &str) -> Vec<String> {
    let mut refs = Vec::new();
    for pattern in TABLE_REF_PATTERNS.iter() {
        for caps in pattern.captures_iter(query) {
            let name = caps[1].to_lowercase();
            if !refs.contains(&name) {
                refs.push(name);
            }
        }
    }
    refs
}

fn glob_matches(glob: &str, table: &str) -> bool {
    let escaped = regex::escape(glob).replace(r"\*", ".*");
    Regex::new(&format!("(?i)^{escaped}$"))
        .map(|re| re.is_match(table))
        .unwrap_or(false)
}

fn check_table_access(query: &str, profile: &RestrictionProfile) -> Result<(), Violation> {
    for table in extract_table_refs(query) {
        if let Some((schema, _)) = table.split_once('.') {
            // The default namespace is always implicitly allowed.
            if schema != "public" && !profile.allowed_schemas.contains(&schema) {
                return Err(Violation::new(
                    "schema_not_allowed",
                    Severity::Medium,
                    format!("access to schema '{schema}' not permitted"),
                ));
            }
        }
        for glob in profile.blocked_tables {
            if glob_matches(glob, &table) {
                return Err(Violation::new(
                    "table_blocked",
                    Severity::Medium,
                    format!("access to table '{table}' not permitted"),
                ));
            }
        }
    }
    Ok(())
}

fn check_size(query: &str, max_size: usize) -> Result<(), Violation> {
    if query.len() > max_size {
        return Err(Violation::new(
            "query_too_large",
            Severity::Low,
            format!("query is {} bytes (limit {max_size})", query.len()),
        ));
    }
    Ok(())
}

// Abuse guards, not correctness guards.
const MAX_STATEMENTS: usize = 5;
const MAX_SUBQUERIES: usize = 3;
const MAX_JOINS: usize = 10;

fn check_structure(query: &str) -> Result<(), Violation> {
    let statements = query.split(';').filter(|s| !s.trim().is_empty()).count();
    if statements > MAX_STATEMENTS {
        return Err(Violation::new(
            "statement_count",
            Severity::Low,
            format!("{statements} statements in one request (limit {MAX_STATEMENTS})"),
        ));
    }
    let subqueries = SUBQUERY_RE.find_iter(query).count();
    if subqueries > MAX_SUBQUERIES {
        return Err(Violation::new(
            "subquery_depth",
            Severity::Low,
            format!("{subqueries} nested sub-selects (limit {MAX_SUBQUERIES})"),
        ));
    }
    let joins = JOIN_RE.find_iter(query).count();
    if joins > MAX_JOINS {
        return Err(Violation::new(
            "join_count",
            Severity::Low,
            format!("{joins} join clauses (limit {MAX_JOINS})"),
        ));
    }
    Ok(())
}

/// SHA-256 of the raw query, hex encoded. Logged in place of the query.
pub fn query_hash(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hex::encode(hasher.finalize())
}

/// First 100 characters, for audit records.
pub fn query_preview(query: &str) -> String {
    query.chars().take(100).collect()
}

static PASSWORD_LITERAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)password\s*=\s*'[^']*'").unwrap());
static TOKEN_LITERAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)token\s*=\s*'[^']*'").unwrap());
static LONG_LITERAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"'[^']{32,}'").unwrap());

/// Mask password/token-like literals before a query fragment reaches a log.
pub fn sanitize_for_log(query: &str) -> String {
    let masked = PASSWORD_LITERAL_RE.replace_all(query, "password='***'");
    let masked = TOKEN_LITERAL_RE.replace_all(&masked, "token='***'");
    LONG_LITERAL_RE.replace_all(&masked, "'***'").into_owned()
}
