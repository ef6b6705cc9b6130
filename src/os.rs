//! This module is just a facade to the os-specific implementation.

use once_cell::sync::Lazy;

#[cfg(unix)]
pub use crate::unix::*;

/// System page size, fetched once. All buffer reservations and the
/// full-flush unit are derived from it.
pub static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size);
