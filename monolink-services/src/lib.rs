pub mod codec;
pub mod echo;
