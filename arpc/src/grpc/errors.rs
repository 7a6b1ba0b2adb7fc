//! Mapping application errors to gRPC statuses
//!
//! An [`ErrorMapper`] holds an ordered list of cases. The first case matching an error
//! produces the status; errors matching no case get the default code.
//!
//! ```ignore
//! let mapper = ErrorMapper::new(Code::Internal)
//!     .is(StoryError::NotFound, Code::NotFound)
//!     .as_kind::<ValidationError>(Code::InvalidArgument);
//!
//! service.exec(request).await.map_err(|e| mapper.handle(&e))
//! ```
//!
//! Cases look through the whole [`source`](std::error::Error::source) chain, so wrapped
//! errors still match.

use std::error::Error as StdError;
use std::fmt;
use tonic::{Code, Status};

type Case = Box<dyn Fn(&(dyn StdError + 'static)) -> Option<Status> + Send + Sync>;

/// Ordered error to status mapping
///
/// Immutable once built, share it freely between tasks.
pub struct ErrorMapper {
    cases: Vec<Case>,
    default_code: Code,
}

impl ErrorMapper {
    /// Mapper falling back to `default_code`
    pub fn new(default_code: Code) -> Self {
        Self {
            cases: Vec::new(),
            default_code,
        }
    }

    /// Add a custom case. Return `Some` to handle the error.
    pub fn test<F>(mut self, case: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> Option<Status> + Send + Sync + 'static,
    {
        self.cases.push(Box::new(case));
        self
    }

    /// Errors equal to `target` map to `code`, keeping their message
    pub fn is<E>(self, target: E, code: Code) -> Self
    where
        E: StdError + PartialEq + Send + Sync + 'static,
    {
        self.test(move |err| {
            is_target(err, &target).then(|| Status::new(code, err.to_string()))
        })
    }

    /// Errors equal to `target` map to `code`, prefixing the message with `wrap`
    pub fn is_wrapped<E>(self, target: E, code: Code, wrap: impl fmt::Display) -> Self
    where
        E: StdError + PartialEq + Send + Sync + 'static,
    {
        let wrap = wrap.to_string();
        self.test(move |err| {
            is_target(err, &target).then(|| Status::new(code, joined(&wrap, err)))
        })
    }

    /// Errors equal to `target` map to `code` with a fixed message
    pub fn is_with_message<E>(self, target: E, code: Code, message: impl Into<String>) -> Self
    where
        E: StdError + PartialEq + Send + Sync + 'static,
    {
        let message = message.into();
        self.test(move |err| is_target(err, &target).then(|| Status::new(code, message.clone())))
    }

    /// Errors of type `E` map to `code`, keeping their message
    pub fn as_kind<E>(self, code: Code) -> Self
    where
        E: StdError + 'static,
    {
        self.test(move |err| is_kind::<E>(err).then(|| Status::new(code, err.to_string())))
    }

    /// Errors of type `E` map to `code`, prefixing the message with `wrap`
    pub fn as_kind_wrapped<E>(self, code: Code, wrap: impl fmt::Display) -> Self
    where
        E: StdError + 'static,
    {
        let wrap = wrap.to_string();
        self.test(move |err| is_kind::<E>(err).then(|| Status::new(code, joined(&wrap, err))))
    }

    /// Errors of type `E` map to `code` with a fixed message
    pub fn as_kind_with_message<E>(self, code: Code, message: impl Into<String>) -> Self
    where
        E: StdError + 'static,
    {
        let message = message.into();
        self.test(move |err| is_kind::<E>(err).then(|| Status::new(code, message.clone())))
    }

    /// Map an error to a status
    pub fn handle(&self, err: &(dyn StdError + 'static)) -> Status {
        self.cases
            .iter()
            .find_map(|case| case(err))
            .unwrap_or_else(|| Status::new(self.default_code, err.to_string()))
    }

    /// Number of registered cases
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    /// Whether no case is registered
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

impl fmt::Debug for ErrorMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorMapper")
            .field("cases", &self.cases.len())
            .field("default_code", &self.default_code)
            .finish()
    }
}

fn chain<'a>(err: &'a (dyn StdError + 'static)) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |&e| e.source())
}

fn is_target<E>(err: &(dyn StdError + 'static), target: &E) -> bool
where
    E: StdError + PartialEq + 'static,
{
    chain(err).any(|e| e.downcast_ref::<E>() == Some(target))
}

fn is_kind<E>(err: &(dyn StdError + 'static)) -> bool
where
    E: StdError + 'static,
{
    chain(err).any(|e| e.is::<E>())
}

fn joined(wrap: &str, err: &(dyn StdError + 'static)) -> String {
    format!("{}\n{}", wrap, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Debug, Error, PartialEq)]
    enum StoryError {
        #[error("story not found")]
        NotFound,
        #[error("story is locked")]
        Locked,
    }

    #[derive(Debug, Error)]
    #[error("invalid field {field}")]
    struct ValidationError {
        field: String,
    }

    #[derive(Debug, Error)]
    #[error("update story")]
    struct UpdateError {
        #[source]
        source: StoryError,
    }

    fn mapper() -> ErrorMapper {
        ErrorMapper::new(Code::Internal)
            .is(StoryError::NotFound, Code::NotFound)
            .is_wrapped(StoryError::Locked, Code::FailedPrecondition, "cannot edit")
            .as_kind::<ValidationError>(Code::InvalidArgument)
    }

    #[test]
    fn test_is() {
        let status = mapper().handle(&StoryError::NotFound);
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "story not found");
    }

    #[test]
    fn test_is_wrapped() {
        let status = mapper().handle(&StoryError::Locked);
        assert_eq!(status.code(), Code::FailedPrecondition);
        assert_eq!(status.message(), "cannot edit\nstory is locked");
    }

    #[test]
    fn test_as_kind() {
        let err = ValidationError {
            field: "title".to_string(),
        };
        let status = mapper().handle(&err);
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "invalid field title");
    }

    #[test]
    fn test_matches_through_source_chain() {
        let err = UpdateError {
            source: StoryError::NotFound,
        };
        let status = mapper().handle(&err);
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "update story");
    }

    #[derive(Debug, Error)]
    #[error("publish chapter")]
    struct PublishError {
        #[source]
        source: UpdateError,
    }

    #[test]
    fn test_matches_deep_in_source_chain() {
        let err = PublishError {
            source: UpdateError {
                source: StoryError::Locked,
            },
        };
        assert_eq!(chain(&err).count(), 3);

        let status = mapper().handle(&err);
        assert_eq!(status.code(), Code::FailedPrecondition);
        assert_eq!(status.message(), "cannot edit\npublish chapter");
    }

    #[test]
    fn test_default_code() {
        let err = std::io::Error::other("disk full");
        let status = mapper().handle(&err);
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "disk full");
    }

    #[test]
    fn test_first_match_wins() {
        let mapper = ErrorMapper::new(Code::Unknown)
            .as_kind_with_message::<StoryError>(Code::Aborted, "story error")
            .is(StoryError::NotFound, Code::NotFound);
        assert_eq!(mapper.len(), 2);

        let status = mapper.handle(&StoryError::NotFound);
        assert_eq!(status.code(), Code::Aborted);
        assert_eq!(status.message(), "story error");
    }

    #[test]
    fn test_fixed_messages_and_custom_cases() {
        let mapper = ErrorMapper::new(Code::Unknown)
            .is_with_message(StoryError::NotFound, Code::NotFound, "no such story")
            .as_kind_wrapped::<ValidationError>(Code::InvalidArgument, "bad request")
            .test(|err| {
                err.to_string()
                    .contains("timeout")
                    .then(|| Status::deadline_exceeded("too slow"))
            });

        let status = mapper.handle(&StoryError::NotFound);
        assert_eq!(status.message(), "no such story");

        let status = mapper.handle(&ValidationError {
            field: "title".to_string(),
        });
        assert_eq!(status.message(), "bad request\ninvalid field title");

        let status = mapper.handle(&std::io::Error::other("read timeout"));
        assert_eq!(status.code(), Code::DeadlineExceeded);

        let status = mapper.handle(&StoryError::Locked);
        assert_eq!(status.code(), Code::Unknown);
    }

    #[test]
    fn test_shared_between_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ErrorMapper>();
    }
}
