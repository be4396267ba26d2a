//! Hostloop
//!
//! Runs rounds of loop-worker pools and checks that every deferred guest call
//! ran once, on its own worker, with the arguments it was given.

pub mod settings;
pub mod trial;
