//! End-to-end scenario suite
//!
//! Exercises the public engine surface the way the HTTP layer does:
//! create/tag/list, temporal snapshots, chunked content, crash replay,
//! multi-tag queries, and bounded integrity recovery.

mod common;

mod basic;
mod chunked;
mod crash;
mod maintenance;
mod queries;
mod recovery;
mod temporal;
