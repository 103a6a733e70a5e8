use std::sync::Arc;

use thiserror::Error;

use crate::val::Val;

pub type VmResult<T> = Result<T, VmError>;

/// Error taxonomy of the frame engine.
///
/// Only [`VmError::Exception`] is visible to `catch`. Resource exhaustion runs enclosing
/// `finally` bodies but can never be discarded by them; fatal errors skip them entirely.
#[derive(Debug, Clone, Error)]
pub enum VmError {
    #[error("uncaught exception: {0}")]
    Exception(Exception),
    #[error("stack overflow")]
    StackOverflow,
    #[error("out of memory")]
    OutOfMemory,
    #[error("fatal internal error: {0}")]
    Fatal(String),
}

impl VmError {
    #[inline]
    pub fn is_catchable(&self) -> bool {
        matches!(self, VmError::Exception(_))
    }

    #[inline]
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, VmError::StackOverflow | VmError::OutOfMemory)
    }

    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, VmError::Fatal(_))
    }

    /// Thrown value for user exceptions.
    pub fn exception_value(&self) -> Option<&Val> {
        match self {
            VmError::Exception(exc) => Some(&exc.value),
            _ => None,
        }
    }
}

/// A language-level thrown value plus the interpreted call chain at the throw site.
#[derive(Debug, Clone)]
pub struct Exception {
    pub value: Val,
    pub trace: Vec<Arc<str>>,
    /// Set once a debug hook has seen the exception so outer frames do not report it again.
    pub(crate) reported: bool,
}

impl Exception {
    pub fn new(value: Val, trace: Vec<Arc<str>>) -> Self {
        Self {
            value,
            trace,
            reported: false,
        }
    }
}

impl std::fmt::Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)?;
        for name in self.trace.iter().rev() {
            write!(f, "\n    at {name}")?;
        }
        Ok(())
    }
}

#[inline]
pub(crate) fn fatal(msg: impl Into<String>) -> VmError {
    VmError::Fatal(msg.into())
}

/// Return a fatal internal error unless the condition holds.
macro_rules! ensure_fatal {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::VmError::Fatal(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure_fatal;
