//! Commit proxy engine.
//!
//! This crate provides the admission-to-reply path of the commit
//! pipeline. Higher layers supply a `Master`, `Resolver`s and a
//! `LogSystem` (see `braid_core::interfaces`), then drive commits and
//! read-version requests through `CommitProxy`.

pub mod proxy;
