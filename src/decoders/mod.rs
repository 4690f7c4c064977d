use thiserror::Error;

pub mod basics;
pub mod fuji_compressed;
pub mod image;
pub mod olympus;

/// Terminal decode failures. One of these is returned per invocation;
/// nothing is retried and partial output is not rolled back.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DecompressError {
    #[error("unexpected end of input")]
    IoEof,
    #[error("bit stream exhausted mid-decode")]
    TruncatedBitstream,
    #[error("corrupt header: {0}")]
    CorruptHeader(String),
    #[error("input out of supported range: {0}")]
    InputRange(String),
    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DecompressError>;

/// The decoder kinds this crate implements. Dispatch happens once per
/// frame, so a plain enum is all that is needed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decompressor {
    Olympus,
    Fuji,
}

impl Decompressor {
    pub fn decompress(&self, img: &mut image::RawImage, input: &[u8]) -> Result<()> {
        match self {
            Decompressor::Olympus => olympus::decompress_olympus(img, input),
            Decompressor::Fuji => fuji_compressed::decompress_fuji(img, input),
        }
    }
}
