//! Model provider implementations for Toolmesh.
//!
//! The execution loop only ever talks to the `ModelProvider` trait from
//! `toolmesh-core`; this crate supplies concrete backends. Today that is the
//! OpenAI-compatible HTTP surface, which covers the large majority of hosted
//! and self-hosted models.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;
