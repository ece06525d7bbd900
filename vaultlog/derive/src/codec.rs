use proc_macro2::TokenStream;
use quote::{quote, ToTokens};
use syn::{
    spanned::Spanned, Data, DataStruct, DeriveInput, Fields, GenericParam, Generics, Lifetime,
    LifetimeParam,
};

use crate::misc::add_traits_bounds;

/// Extracts the fields of a struct, or reports a compile error for other items.
fn struct_fields(input: &DeriveInput, derive: &str) -> Result<Fields, TokenStream> {
    match &input.data {
        Data::Struct(DataStruct { fields, .. }) => Ok(fields.clone()),
        _ => {
            let err_msg = format!("`#[derive({derive})]` only supports structs");
            Err(syn::Error::new(input.ident.span(), err_msg).into_compile_error())
        }
    }
}

/// `Encode` derive macro implementation.
///
/// Fields are written in declaration order, the wire layout is therefore the struct
/// layout.
pub fn impl_encode(input: DeriveInput) -> TokenStream {
    let fields = match struct_fields(&input, "Encode") {
        Ok(fields) => fields,
        Err(err) => return err,
    };

    let name = input.ident;
    let generics = add_traits_bounds(input.generics, [quote!(crate::codec::Encode)]);
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let body = fields.into_iter().enumerate().map(|(i, f)| {
        let member = f
            .ident
            .map(|f| f.into_token_stream())
            .unwrap_or_else(|| syn::Index::from(i).into_token_stream());
        quote! { crate::codec::Encode::encode(&self.#member, sink)?; }
    });

    quote! {
        impl #impl_generics crate::codec::Encode for #name #ty_generics #where_clause {
            fn encode<S>(&self, sink: &mut S) -> ::core::result::Result<(), S::Error>
            where
                S: crate::codec::Sink,
            {
                #(#body)*
                Ok(())
            }
        }
    }
}

/// `Decode` derive macro implementation.
pub fn impl_decode(input: DeriveInput) -> TokenStream {
    let fields = match struct_fields(&input, "Decode") {
        Ok(fields) => fields,
        Err(err) => return err,
    };

    let name = input.ident;
    let generics = add_traits_bounds(input.generics, [quote!(crate::codec::Decode<'de>)]);
    let (_, ty_generics, where_clause) = generics.split_for_impl();
    let generics = add_de_lifetime(generics.clone());
    let impl_generics = generics.split_for_impl().0;

    let decode = quote! { crate::codec::Decode::decode(source)? };
    let construct_body = match fields {
        Fields::Named(fields) => {
            let fields = fields.named.into_iter().filter_map(|f| f.ident);
            quote! { { #(#fields: #decode,)* } }
        }
        Fields::Unnamed(fields) => {
            let fields = fields.unnamed.into_iter().map(|_| &decode);
            quote! { ( #(#fields,)* ) }
        }
        Fields::Unit => quote!(),
    };

    quote! {
        impl #impl_generics crate::codec::Decode<'de> for #name #ty_generics #where_clause {
            fn decode<S>(source: &mut S) -> ::core::result::Result<Self, S::Error>
            where
                S: crate::codec::Source<'de>,
            {
                Ok(#name #construct_body)
            }
        }
    }
}

/// Introduces the `'de` lifetime, outliving every lifetime of the struct:
/// `'de: 'a + 'b`.
fn add_de_lifetime(mut generics: Generics) -> Generics {
    let lifetimes: Vec<_> = generics.lifetimes().map(|l| l.lifetime.clone()).collect();

    let mut de_lifetime = LifetimeParam::new(Lifetime::new("'de", generics.span()));
    de_lifetime.bounds.extend(lifetimes);

    generics.params.push(GenericParam::Lifetime(de_lifetime));
    generics
}
