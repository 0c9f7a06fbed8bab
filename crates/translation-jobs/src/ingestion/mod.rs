//! Document ingestion: splitting source text into dispatchable chunks

mod chunker;

pub use chunker::{ends_sentence, non_blank_lines, LineChunker, TextChunk};
