//! The error returned when a container fails to allocate a new element.

use core::fmt;

use thiserror::Error;

////////////////////////////////////////////////////////////////////////////////////////////////////
// AllocError
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The error returned by `try_push` when no memory could be allocated for a
/// new element.
///
/// The container is left unchanged and the rejected element is handed back,
/// so it can be recovered with [`into_inner`][AllocError::into_inner].
#[derive(Copy, Clone, Eq, PartialEq, Error)]
#[error("failed to allocate memory for a new element")]
pub struct AllocError<T>(pub T);

/********** impl inherent *************************************************************************/

impl<T> AllocError<T> {
    /// Returns the element that could not be inserted.
    #[inline]
    pub fn into_inner(self) -> T {
        self.0
    }
}

/********** impl Debug ****************************************************************************/

impl<T> fmt::Debug for AllocError<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AllocError").finish_non_exhaustive()
    }
}
