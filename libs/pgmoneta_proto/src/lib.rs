//! C1 — wire codec. Frames and parses length-prefixed messages of the
//! origin protocol, and implements the four authentication sub-protocols
//! (trust, cleartext, MD5, SASL/SCRAM-SHA-256) named in spec.md §4.1.

pub mod frame;
pub mod md5;
pub mod message;
pub mod scram;

pub use frame::{read_frame, read_untagged, write_frame, write_untagged, Frame, WireError};
pub use message::{
    encode_ssl_request, encode_startup_message, parse_auth_request, parse_copy_data,
    parse_error_response, AuthRequest, CopyDataMessage, ErrorFields, StandbyStatusUpdate,
};
pub use scram::{ScramClient, ScramError, SCRAM_SHA_256};
