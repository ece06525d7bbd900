//! Compression & Decompression.
//!
//! The compressor runs one continuous `Zstandard` stream per compression epoch:
//! every item is flushed on its own, so it can be appended to the cache right
//! away, while later items still reference the window of earlier ones.
//! [`Compressor::reset`] starts a new epoch, i.e. a new frame.

use thiserror::Error;

use crate::Sealed;

/// Errors that can be occurred during compression or decompression.
#[derive(Error, Clone, Debug)]
#[error("{message}")]
pub struct Error {
    /// Represents an error code from the underlying compression library.
    code: usize,
    /// Represents an error descriptive message.
    message: String,
}

impl Error {
    /// The raw error code of the compression library.
    #[inline]
    pub fn code(&self) -> usize {
        self.code
    }
}

/// Operation of compression. Different values are used according to different flush
/// dimensions.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CompressOp<'a> {
    Input(&'a [u8]),
    Flush,
}

/// Represents a target for compressed data or decompressed data.
pub(crate) trait Sink: crate::Sink<Error> {}

impl<T> Sink for T where T: crate::Sink<Error> {}

/// Represents a compressor that compresses data to its target (`Sink`).
pub(crate) trait Compressor: Sealed {
    fn compress<S>(&mut self, operation: CompressOp, sink: &mut S) -> Result<(), S::Error>
    where
        S: Sink;

    /// Discards the window and starts a new stream.
    fn reset(&mut self) -> Result<(), Error>;
}

/// Represents a decompressor that decompresses data to its target (`Sink`).
pub(crate) trait Decompressor: Sealed {
    fn decompress<S>(&mut self, input: &[u8], sink: &mut S) -> Result<(), S::Error>
    where
        S: Sink;

    /// Discards the window and expects a new stream.
    fn reset(&mut self) -> Result<(), Error>;
}

pub(crate) use zstd::{Compressor as ZstdCompressor, Decompressor as ZstdDecompressor};

/// `Compressor` and `Decompressor` for the `Zstandard` compression algorithm.
pub(crate) mod zstd {
    use zstd_safe::{
        get_error_name, max_c_level, min_c_level, zstd_sys::ZSTD_EndDirective, CCtx, CParameter,
        DCtx, ErrorCode, InBuffer, OutBuffer, ResetDirective,
    };

    use crate::{
        compress::{
            CompressOp, Compressor as CompressorTrait, Decompressor as DecompressorTrait, Error,
            Sink,
        },
        Sealed,
    };

    /// Every `Zstandard` frame starts with these bytes.
    const FRAME_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

    /// Whether the compressed bytes start a new frame.
    ///
    /// A continuation block can never look like this: read as a block header the
    /// magic declares a raw block larger than the `Zstandard` block size limit.
    #[inline]
    pub(crate) fn starts_frame(bytes: &[u8]) -> bool {
        bytes.starts_with(&FRAME_MAGIC)
    }

    impl From<ErrorCode> for Error {
        #[inline]
        fn from(code: ErrorCode) -> Self {
            let message = get_error_name(code).to_string();
            Self { code, message }
        }
    }

    impl From<CompressOp<'_>> for ZSTD_EndDirective {
        #[inline]
        fn from(value: CompressOp) -> Self {
            match value {
                CompressOp::Input(_) => Self::ZSTD_e_continue,
                CompressOp::Flush => Self::ZSTD_e_flush,
            }
        }
    }

    /// The `Zstandard` compressor.
    pub(crate) struct Compressor {
        context: CCtx<'static>,
        output_buffer: Vec<u8>,
    }

    impl Compressor {
        /// The default compression level.
        pub(crate) const DEFAULT_LEVEL: i32 = 10;

        /// Length of `output buffer`.
        ///
        /// An output buffer of 256 bytes should be sufficient for compression of a
        /// log.
        const BUFFER_LEN: usize = 256;

        /// Constructs a new `Compressor` with compression level.
        ///
        /// `zstd` supports compression levels from 1 up to 22, it also offers
        /// negative compression levels, which extend the range of speed vs.
        /// ratio preferences. The level is clamped to the supported range.
        pub(crate) fn new(level: i32) -> Result<Self, Error> {
            let mut context = CCtx::create();
            let level = level.clamp(min_c_level(), max_c_level());
            context.set_parameter(CParameter::CompressionLevel(level))?;

            Ok(Self { context, output_buffer: vec![0; Self::BUFFER_LEN] })
        }
    }

    impl CompressorTrait for Compressor {
        fn compress<S>(&mut self, operation: CompressOp, sink: &mut S) -> Result<(), S::Error>
        where
            S: Sink,
        {
            let (bytes, is_input_oper) = match operation {
                CompressOp::Input(bytes) => (bytes, true),
                _ => (&[] as &[u8], false),
            };

            let mut input = InBuffer::around(bytes);
            loop {
                let mut output = OutBuffer::around(self.output_buffer.as_mut_slice());
                // Compress into the output buffer and write all of the output to the `Sink` so we
                // can reuse the buffer next iteration.
                let remaining = self
                    .context
                    .compress_stream2(&mut output, &mut input, operation.into())
                    .map_err(Error::from)?;
                if output.pos() > 0 {
                    sink.sink(output.as_slice())?;
                }

                // If we use `Input` we're finished when we've consumed all the input.
                // On `Flush`, we're finished when zstd returns 0, which means it's consumed all the
                // input and flushed everything.
                let finished =
                    if is_input_oper { input.pos == input.src.len() } else { remaining == 0 };
                if finished {
                    break Ok(());
                }
            }
        }

        #[inline]
        fn reset(&mut self) -> Result<(), Error> {
            self.context.reset(ResetDirective::SessionOnly)?;
            Ok(())
        }
    }

    impl Sealed for Compressor {}

    /// The `Zstandard` decompressor.
    pub(crate) struct Decompressor {
        context: DCtx<'static>,
        output_buffer: Vec<u8>,
    }

    impl Decompressor {
        /// Length of `output buffer`.
        ///
        /// Uses 1KB as the output buffer length for decompression.
        const BUFFER_LEN: usize = 1024;

        /// Constructs a new `Decompressor`.
        #[inline]
        pub(crate) fn new() -> Decompressor {
            Self { context: DCtx::create(), output_buffer: vec![0; Self::BUFFER_LEN] }
        }
    }

    impl DecompressorTrait for Decompressor {
        fn decompress<S>(&mut self, input: &[u8], sink: &mut S) -> Result<(), S::Error>
        where
            S: Sink,
        {
            let mut input = InBuffer::around(input);
            loop {
                let mut output = OutBuffer::around(self.output_buffer.as_mut_slice());
                self.context.decompress_stream(&mut output, &mut input).map_err(Error::from)?;

                let (written, capacity) = (output.pos(), output.capacity());
                if written > 0 {
                    sink.sink(output.as_slice())?;
                }

                // A full output buffer may leave flushed bytes behind inside the context,
                // even after the whole input has been consumed.
                if input.pos == input.src.len() && written < capacity {
                    break Ok(());
                }
            }
        }

        #[inline]
        fn reset(&mut self) -> Result<(), Error> {
            self.context.reset(ResetDirective::SessionOnly)?;
            Ok(())
        }
    }

    impl Default for Decompressor {
        #[inline]
        fn default() -> Self {
            Self::new()
        }
    }

    impl Sealed for Decompressor {}
}
