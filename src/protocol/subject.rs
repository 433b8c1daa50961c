//! Subject validation and wildcard matching
//!
//! Subjects are dot-separated tokens. Publishing requires a literal subject;
//! subscriptions may use `*` (one token) and a trailing `>` (one or more tokens).

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SubjectError {
    #[error("subject cannot be empty")]
    Empty,
    #[error("subject contains whitespace: {0:?}")]
    Whitespace(String),
    #[error("subject has an empty token: {0:?}")]
    EmptyToken(String),
    #[error("wildcards are not allowed when publishing: {0:?}")]
    WildcardInPublish(String),
    #[error("misplaced wildcard in subject: {0:?}")]
    MisplacedWildcard(String),
    #[error("invalid queue group: {0:?}")]
    InvalidQueueGroup(String),
}

fn check_tokens(subject: &str) -> Result<(), SubjectError> {
    if subject.is_empty() {
        return Err(SubjectError::Empty);
    }
    if subject.chars().any(char::is_whitespace) {
        return Err(SubjectError::Whitespace(subject.to_string()));
    }
    if subject.split('.').any(str::is_empty) {
        return Err(SubjectError::EmptyToken(subject.to_string()));
    }
    Ok(())
}

/// Validate a subject for `PUB` (no wildcards)
pub fn validate_publish_subject(subject: &str) -> Result<(), SubjectError> {
    check_tokens(subject)?;
    if subject.split('.').any(|token| token == "*" || token == ">") {
        return Err(SubjectError::WildcardInPublish(subject.to_string()));
    }
    Ok(())
}

/// Validate a subject for `SUB`. `*` must be a whole token, `>` only the last one.
pub fn validate_subscribe_subject(subject: &str) -> Result<(), SubjectError> {
    check_tokens(subject)?;
    let tokens: Vec<&str> = subject.split('.').collect();
    for (index, token) in tokens.iter().enumerate() {
        let has_wildcard = token.contains('*') || token.contains('>');
        let valid = match *token {
            "*" => true,
            ">" => index == tokens.len() - 1,
            _ => !has_wildcard,
        };
        if !valid {
            return Err(SubjectError::MisplacedWildcard(subject.to_string()));
        }
    }
    Ok(())
}

pub fn validate_queue_group(queue: &str) -> Result<(), SubjectError> {
    if queue.is_empty() || queue.chars().any(char::is_whitespace) {
        return Err(SubjectError::InvalidQueueGroup(queue.to_string()));
    }
    Ok(())
}

/// Whether a literal `subject` matches a subscription `pattern`
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
