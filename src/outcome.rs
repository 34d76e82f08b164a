use crate::fault::{catching, Fault};

/// The result of an asynchronous computation: a value or a [`Fault`].
///
/// Unlike a bare `Result`, the failure type is fixed and every transform is
/// total: a panic inside a supplied closure is captured and becomes a
/// `Failure` instead of unwinding through the completion machinery.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The computation produced a value.
    Success(T),
    /// The computation failed.
    Failure(Fault),
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    /// Transform a successful value; a panic inside `f` becomes a failure.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Success(value) => match catching(move || f(value)) {
                Ok(mapped) => Outcome::Success(mapped),
                Err(fault) => Outcome::Failure(fault),
            },
            Outcome::Failure(fault) => Outcome::Failure(fault),
        }
    }

    /// Chain a fallible transform over a successful value.
    pub fn and_then<U>(self, f: impl FnOnce(T) -> Outcome<U>) -> Outcome<U> {
        match self {
            Outcome::Success(value) => match catching(move || f(value)) {
                Ok(outcome) => outcome,
                Err(fault) => Outcome::Failure(fault),
            },
            Outcome::Failure(fault) => Outcome::Failure(fault),
        }
    }

    /// Keep a successful value only when `p` accepts it; otherwise the
    /// outcome becomes [`Fault::PredicateFailed`].
    pub fn filter(self, p: impl FnOnce(&T) -> bool) -> Outcome<T> {
        match self {
            Outcome::Success(value) => {
                let keep = catching(|| p(&value));
                match keep {
                    Ok(true) => Outcome::Success(value),
                    Ok(false) => Outcome::Failure(Fault::PredicateFailed),
                    Err(fault) => Outcome::Failure(fault),
                }
            }
            failure => failure,
        }
    }

    /// The value, if this outcome is a success.
    pub fn success(self) -> Option<T> {
        match self {
            Outcome::Success(value) => Some(value),
            Outcome::Failure(_) => None,
        }
    }

    /// The fault, if this outcome is a failure.
    pub fn failure(self) -> Option<Fault> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(fault) => Some(fault),
        }
    }
}

impl<T> From<Result<T, Fault>> for Outcome<T> {
    fn from(result: Result<T, Fault>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(fault) => Outcome::Failure(fault),
        }
    }
}

impl<T> From<Outcome<T>> for Result<T, Fault> {
    fn from(outcome: Outcome<T>) -> Self {
        match outcome {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(fault) => Err(fault),
        }
    }
}
