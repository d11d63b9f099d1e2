pub mod decode;

pub use decode::{NdjsonDecoder, SseDecoder, SseEvent, parse_json_sse_stream};
