//! HTTP/1 parsing and analysis (spec.md §5).

pub mod analyzers;
pub mod header;
pub mod message;
pub mod parser;

pub use analyzers::{AnResult, AnalyzeCtx, ConnectionMode};
pub use header::{HeaderIdx, HeaderList, Span};
pub use message::{BodyCoding, ChunkedState, HttpMessage, MsgState};
pub use parser::{ParseError, StepOutcome};
