use core::fmt::Debug;

/// `BaseError` is a common trait implemented by every error type defined in the crate.
///
/// It is dependent on the [`Debug`] trait, which makes sense as we are dealing with errors.
pub trait BaseError: Debug {}

/// `CanFail` is a return type for functions that are allowed to fail, and don't need to return
/// anything.
///
/// For instance, it could be used when initializing a component or a shared `static`.
///
/// # Examples:
///
/// ```
/// use smalloc::{BaseError, CanFail};
///
/// #[derive(Debug)]
/// struct InitError {}
///
/// impl BaseError for InitError {}
///
/// fn init_component() -> CanFail<InitError> {
///     todo!()
/// }
/// ```
pub type CanFail<T> = Result<(), T>;
