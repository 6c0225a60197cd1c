//! Concrete collaborator drivers.

pub mod openai;

pub use openai::OpenAiCompatGenerator;
