pub mod azure;
pub mod deepgram_native;
pub mod deepgram_split;
pub mod openai;
