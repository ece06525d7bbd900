use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DataStruct, DeriveInput, Fields};

use crate::misc::add_traits_bounds;

/// `Builder Pattern` derive macro implementation.
pub fn impl_builder(input: DeriveInput) -> TokenStream {
    let Data::Struct(DataStruct { fields: Fields::Named(fields), .. }) = input.data else {
        let err_msg = "`#[derive(Builder)]` only supports structs with named fields";
        return syn::Error::new(input.ident.span(), err_msg).into_compile_error();
    };

    let (name, vis) = (input.ident, input.vis);
    let generics = add_traits_bounds(input.generics, [quote!(Default)]);
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let builder_name = format_ident!("{name}Builder");
    let builder_doc = format!("Builder for [`{name}`], unset fields keep their default values.");

    // Every setter consumes the builder and accepts anything convertible into the field type.
    let setters = fields.named.into_iter().filter_map(|f| {
        let (field, ty) = (f.ident?, f.ty);
        let doc = format!("Sets [`{name}::{field}`].");
        Some(quote! {
            #[doc = #doc]
            #[inline]
            #[must_use]
            #vis fn #field(mut self, #field: impl ::core::convert::Into<#ty>) -> Self {
                self.0.#field = #field.into();
                self
            }
        })
    });

    quote! {
        #[doc = #builder_doc]
        #vis struct #builder_name #impl_generics(#name #ty_generics) #where_clause;

        impl #impl_generics #name #ty_generics #where_clause {
            /// Returns a builder seeded with the default value.
            #[inline]
            #vis fn builder() -> #builder_name #ty_generics {
                #builder_name::new()
            }
        }

        impl #impl_generics #builder_name #ty_generics #where_clause {
            /// Constructs a new builder.
            #[inline]
            #vis fn new() -> Self {
                Self(::core::default::Default::default())
            }

            /// Finishes the builder.
            #[inline]
            #vis fn build(self) -> #name #ty_generics {
                self.0
            }

            #(#setters)*
        }

        impl #impl_generics ::core::default::Default for #builder_name #ty_generics #where_clause {
            #[inline]
            fn default() -> Self {
                Self::new()
            }
        }
    }
}
