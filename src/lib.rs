//! rawdec is a library decompressing the entropy-coded payloads of
//! proprietary camera RAW formats into planar 16-bit pixel buffers.
//!
//! The crate covers the two hard decode cores, the Olympus predictive
//! entropy decoder and the Fuji compressed (X-Trans / Bayer) decoder,
//! together with the bit-stream, byte-stream, aligned-image and
//! lookup-table machinery they rest on. Container parsing, model
//! detection and colour handling live outside this crate; callers hand
//! in the already-located payload bytes and a pre-sized image buffer.
//!
//! ```rust
//! use rawdec::{RawImage, decompress_olympus};
//!
//! let mut image = RawImage::new(2, 2, 1).unwrap();
//! // 7 opaque prefix bytes followed by the bit stream
//! let payload = [0u8; 9];
//! decompress_olympus(&mut image, &payload).unwrap();
//! assert_eq!(image.row(0), &[0, 0]);
//! ```
//!
//! Both decoders are safe against adversarial input: they either succeed
//! or return a [`DecompressError`], and never read or write out of
//! bounds. Fuji strips decode in parallel; Olympus rows are strictly
//! sequential because the predictor consumes its own earlier output.

mod decoders;

pub use decoders::basics::{BitPumpMSB, ByteStream, Endian, LookupTable};
pub use decoders::fuji_compressed::decompress_fuji;
pub use decoders::image::{RawImage, View2D, View2DMut};
pub use decoders::olympus::decompress_olympus;
pub use decoders::{DecompressError, Decompressor, Result};
