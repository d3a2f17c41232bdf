// The core module contains all business logic.
// Each feature gets its own submodule.

#[path = "confessions/mod.rs"]
pub mod confessions;
