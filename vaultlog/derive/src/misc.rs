use proc_macro2::TokenStream;
use syn::{parse_quote, GenericParam, Generics};

/// Adds the trait bounds to every type parameter: `T: A + B + C`.
pub fn add_traits_bounds(
    mut generics: Generics,
    trait_bounds: impl IntoIterator<Item = TokenStream>,
) -> Generics {
    let trait_bounds: Vec<_> = trait_bounds.into_iter().collect();
    for param in &mut generics.params {
        if let GenericParam::Type(ty_param) = param {
            for trait_bound in &trait_bounds {
                ty_param.bounds.push(parse_quote! { #trait_bound });
            }
        }
    }
    generics
}
