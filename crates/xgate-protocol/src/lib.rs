pub mod ndjson;
pub mod openai;
pub mod sse;
pub mod upstream;
