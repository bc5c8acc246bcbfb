//! The seam to the image decoder.
//!
//! Decoding image formats is not part of this crate. Loads hand their [`FetchResult`] to a
//! [`Decoder`] on the blocking thread pool and deliver whatever it produces.

use bytes::Bytes;

use crate::error::LoadError;
use crate::fetch::FetchResult;
use crate::types::DecodeOptions;

/// Turns fetched data into an image.
pub trait Decoder: Send + Sync + 'static {
    /// The decoded image, shared between all consumers of the same load.
    type Image: Send + Sync + 'static;

    /// Decodes `data`.
    ///
    /// This runs on a blocking thread and may do blocking I/O to read the data. A failure
    /// should be reported as [`LoadError::DecodeFailure`].
    fn decode(&self, data: &FetchResult, options: &DecodeOptions) -> Result<Self::Image, LoadError>;

    /// The approximate memory footprint of `image` in bytes, used to size the memory cache.
    fn weight(&self, image: &Self::Image) -> u32;
}

/// A [`Decoder`] that passes the raw data through.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    type Image = Bytes;

    fn decode(&self, data: &FetchResult, _options: &DecodeOptions) -> Result<Bytes, LoadError> {
        data.read()
            .map_err(|e| LoadError::DecodeFailure(e.to_string()))
    }

    fn weight(&self, image: &Bytes) -> u32 {
        image.len().try_into().unwrap_or(u32::MAX)
    }
}
