//! The internal derive crate for `vaultlog`. Implements the derive macros used by
//! the log record types: `Builder`, `Encode` and `Decode`.

use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput};

use crate::{
    builder::impl_builder,
    codec::{impl_decode, impl_encode},
};

mod builder;
mod codec;
mod misc;

/// Generates a consuming builder for a struct with named fields that implements
/// `Default`.
///
/// ```
/// use vaultlog_derive::Builder;
///
/// #[derive(Builder, Default)]
/// pub struct Endpoint {
///     host: String,
///     port: u16,
/// }
///
/// let endpoint = Endpoint::builder().host("localhost").port(8080u16).build();
/// ```
#[proc_macro_derive(Builder)]
pub fn derive_builder(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    impl_builder(input).into()
}

/// Implements `crate::codec::Encode` by encoding every field in declaration order.
#[proc_macro_derive(Encode)]
pub fn derive_encode(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    impl_encode(input).into()
}

/// Implements `crate::codec::Decode<'de>` by decoding every field in declaration
/// order. Borrowed fields are decoded without copying.
#[proc_macro_derive(Decode)]
pub fn derive_decode(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    impl_decode(input).into()
}
