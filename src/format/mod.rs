pub mod anthropic;
pub mod openai;
pub mod stream;
pub mod to_anthropic;
pub mod to_openai;
