#![forbid(unsafe_code)]

//! Error types.
//!
//! Two families exist and they never mix:
//!
//! - [`ReconcilerError`]: broken internal invariants (hook order, update
//!   loops, host tree corruption). These abort the current operation and are
//!   returned to the embedder.
//! - [`ComponentError`]: failures raised by user code while rendering or
//!   running lifecycles. These are routed to the nearest error boundary and
//!   never surface as `Err` from the public API.
//!
//! A render function reports either family member through [`Throw`].

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::rc::Rc;

use crate::wakeable::Wakeable;

/// Fatal reconciler failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcilerError {
    #[error("hook order changed in `{component}`: expected {expected}, found {found}")]
    HookOrder {
        component: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("`{component}` rendered more hooks than during the previous render")]
    TooManyHooks { component: String },

    #[error("`{component}` rendered fewer hooks than expected")]
    TooFewHooks { component: String },

    #[error("maximum update depth exceeded after {limit} nested updates")]
    MaximumUpdateDepth { limit: u32 },

    #[error("expected a host parent above the placed fiber")]
    MissingHostParent,

    #[error("fiber handle is not in the arena")]
    UnknownFiber,

    #[error("root handle is not registered")]
    UnknownRoot,

    #[error("cannot start rendering or committing while already working")]
    AlreadyWorking,

    #[error("element type `{0}` is not valid here")]
    UnsupportedKind(String),

    #[error("render finished without completing the root")]
    IncompleteRoot,
}

/// Panic payload used to abort a render from inside user-facing hook calls.
///
/// The reconciler recognizes this payload when it catches the unwind and
/// converts it back into the wrapped [`ReconcilerError`].
#[derive(Debug, Clone)]
pub struct InvariantViolation(pub ReconcilerError);

struct ErrorInner {
    message: String,
    source: Option<Box<dyn StdError>>,
}

/// Error raised by component code.
#[derive(Clone)]
pub struct ComponentError {
    inner: Rc<ErrorInner>,
}

impl ComponentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(ErrorInner {
                message: message.into(),
                source: None,
            }),
        }
    }

    /// Wrap any error, keeping it as the source.
    pub fn from_error<E: StdError + 'static>(error: E) -> Self {
        Self {
            inner: Rc::new(ErrorInner {
                message: error.to_string(),
                source: Some(Box::new(error)),
            }),
        }
    }

    /// Convert a caught panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "component panicked".to_string()
        };
        Self::new(message)
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.inner.message
    }

    /// True if both handles refer to the same raised error.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Display for ComponentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.message)
    }
}

impl fmt::Debug for ComponentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentError")
            .field("message", &self.inner.message)
            .finish()
    }
}

impl StdError for ComponentError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_deref()
    }
}

/// Why a render function did not return children.
#[derive(Debug, Clone)]
pub enum Throw {
    /// Not ready; retry once the wakeable settles.
    Suspend(Wakeable),
    /// Failed; route to the nearest error boundary.
    Error(ComponentError),
}

impl Throw {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ComponentError::new(message))
    }
}

impl From<ComponentError> for Throw {
    fn from(error: ComponentError) -> Self {
        Self::Error(error)
    }
}

impl From<Wakeable> for Throw {
    fn from(wakeable: Wakeable) -> Self {
        Self::Suspend(wakeable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("disk on fire")]
    struct Fire;

    #[test]
    fn from_error_keeps_source() {
        let e = ComponentError::from_error(Fire);
        assert_eq!(e.message(), "disk on fire");
        assert!(e.source().is_some());
    }

    #[test]
    fn panic_payloads_are_stringified() {
        let p: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(ComponentError::from_panic(p.as_ref()).message(), "boom");
        let p: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(ComponentError::from_panic(p.as_ref()).message(), "bang");
        let p: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(
            ComponentError::from_panic(p.as_ref()).message(),
            "component panicked"
        );
    }

    #[test]
    fn identity_survives_clone() {
        let a = ComponentError::new("x");
        let b = ComponentError::new("x");
        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
    }

    #[test]
    fn reconciler_errors_render_context() {
        let e = ReconcilerError::MaximumUpdateDepth { limit: 50 };
        assert!(e.to_string().contains("50"));
    }
}
