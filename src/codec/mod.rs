//! Wire codecs: raw HTTP/1.1 framing and body preview decoding.

pub mod http1;
pub mod preview;
