//! Concrete [`crate::provider::Provider`] adapters.
//!
//! `spec.md` §1 excludes "the specific LLM provider clients" from the core;
//! everything under this module is a thin boundary adapter kept at arm's
//! length behind the trait, not part of the runtime proper.

pub mod openai_compatible;
