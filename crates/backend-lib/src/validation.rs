// ============================
// pika-backend-lib/src/validation.rs
// ============================
//! Input validation helpers. Validation faults never mutate state.

use crate::config::PollLimits;
use crate::error::AppError;

const MAX_ID_LEN: usize = 64;

fn validate_id(kind: &str, id: &str) -> Result<(), AppError> {
    if id.is_empty() {
        return Err(AppError::Validation(format!("{kind} must not be empty")));
    }
    if id.len() > MAX_ID_LEN {
        return Err(AppError::Validation(format!(
            "{kind} exceeds {MAX_ID_LEN} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(AppError::Validation(format!(
            "{kind} may only contain alphanumerics, '-' and '_'"
        )));
    }
    Ok(())
}

pub fn validate_session_id(id: &str) -> Result<(), AppError> {
    validate_id("session ID", id)
}

pub fn validate_client_id(id: &str) -> Result<(), AppError> {
    validate_id("client ID", id)
}

pub fn validate_poll_question(question: &str, limits: &PollLimits) -> Result<(), AppError> {
    if question.trim().is_empty() {
        return Err(AppError::Validation("poll question must not be empty".into()));
    }
    if question.len() > limits.max_question_len {
        return Err(AppError::Validation(format!(
            "poll question exceeds {} characters",
            limits.max_question_len
        )));
    }
    Ok(())
}

pub fn validate_poll_options(options: &[String], limits: &PollLimits) -> Result<(), AppError> {
    if options.len() < limits.min_options || options.len() > limits.max_options {
        return Err(AppError::Validation(format!(
            "polls must have between {} and {} options",
            limits.min_options, limits.max_options
        )));
    }
    for option in options {
        if option.trim().is_empty() {
            return Err(AppError::Validation("poll options must not be empty".into()));
        }
        if option.len() > limits.max_option_len {
            return Err(AppError::Validation(format!(
                "poll option exceeds {} characters",
                limits.max_option_len
            )));
        }
    }
    Ok(())
}
