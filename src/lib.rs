#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// the wire formats are byte-oriented; these fire on every deliberate cast
#![allow(clippy::cast_possible_truncation)]

//! A transactional paged storage engine.
//!
//! Fixed-size logical pages over a pluggable block [`backend`], with
//! copy-on-write transactions committed atomically through the backend's
//! compare-and-swap contract. Small writes are carried as binary patches
//! on a single index page and only spill to real backend pages when they
//! outgrow its budget, so touching thousands of pages lightly stays cheap.

pub mod backend;
pub mod index;
pub mod patch;
pub mod store;
pub mod tree;
mod util;
