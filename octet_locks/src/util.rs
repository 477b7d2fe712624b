use std::fmt;

/// Pointer rendered as a bare hex address in trace output
pub(crate) struct TraceAddr(usize);

impl<T> From<*const T> for TraceAddr {
    fn from(p: *const T) -> Self {
        Self(p as usize)
    }
}

impl<T> From<&T> for TraceAddr {
    fn from(p: &T) -> Self {
        Self(p as *const T as usize)
    }
}

impl fmt::Debug for TraceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
