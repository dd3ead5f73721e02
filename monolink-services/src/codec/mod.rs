mod length_delimited;

pub use length_delimited::{
    CodecError, Frame, LengthDelimited, DEFAULT_MAX_FRAME_SIZE, HEADER_LEN, MAX_FRAME_SIZE,
};
