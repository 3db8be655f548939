extern crate proc_macro;

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, Data, DataEnum, DeriveInput, Expr, Fields};

// https://blog.turbo.fish/proc-macro-simple-derive/

/// Derives both `BrokerError` (a marker) and `HttpCode` for the annotated type.
///
/// Structs carry a single `#[code(..)]` attribute. Enums carry one on every variant.
#[proc_macro_derive(BrokerError, attributes(code))]
pub fn broker_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;
    let body = match input.data {
        Data::Struct(_) => {
            let code = code_of(&input.attrs)
                .unwrap_or_else(|| panic!("struct {} must have a #[code(<CODE>)] attribute", name));
            quote!(#code)
        }
        Data::Enum(DataEnum { variants, .. }) => {
            let arms = variants.iter().map(|variant| {
                let v = &variant.ident;
                let code = code_of(&variant.attrs)
                    .unwrap_or_else(|| panic!("variant {} is missing a #[code(<CODE>)] attribute", v));
                let pattern: TokenStream2 = match variant.fields {
                    Fields::Unnamed(_) => quote!(#name::#v(..)),
                    Fields::Named(_) => quote!(#name::#v { .. }),
                    Fields::Unit => quote!(#name::#v),
                };
                quote!(#pattern => { #code })
            });
            quote!(
                match self {
                    #(#arms),*
                }
            )
        }
        Data::Union(..) => panic!("just say no to unions"),
    };
    quote!(
        impl BrokerError for #name {}

        impl HttpCode for #name {
            fn http_code(&self) -> Status {
                #body
            }
        }
    )
    .into()
}

fn code_of(attrs: &[Attribute]) -> Option<Expr> {
    attrs
        .iter()
        .find(|attr| attr.path.is_ident("code"))
        .map(|attr| attr.parse_args().expect("#[code(..)] must wrap a single expression"))
}
