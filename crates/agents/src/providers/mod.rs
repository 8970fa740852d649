//! Model-streaming backends.

pub mod openai;
pub mod openai_compat;

pub use openai::OpenAiCompatProvider;
