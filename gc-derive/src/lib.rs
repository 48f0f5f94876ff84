//! Derive macro for the `NativeState` trait.
//!
//! `#[derive(NativeState)]` sums the external memory of every field marked
//! with `#[native(track)]`. Untracked fields contribute nothing.
//!
//! # Usage
//!
//! ```ignore
//! use openworkers_host_env::NativeState;
//!
//! #[derive(NativeState)]
//! struct Decoder {
//!     #[native(track)]
//!     buffer: Vec<u8>,
//!     #[native(track)]
//!     label: String,
//!     frames: u64,
//! }
//!
//! #[derive(NativeState)]
//! enum Body {
//!     Empty,
//!     Inline(#[native(track)] bytes::Bytes),
//!     Chunked {
//!         #[native(track)]
//!         chunks: Vec<Vec<u8>>,
//!         cursor: usize,
//!     },
//! }
//! ```
//!
//! # Inside the crate
//!
//! Use `#[native(crate_path = "crate")]` on the type:
//!
//! ```ignore
//! #[derive(NativeState)]
//! #[native(crate_path = "crate")]
//! struct InternalBuffer {
//!     #[native(track)]
//!     data: Vec<u8>,
//! }
//! ```

use proc_macro::TokenStream;
use proc_macro2::{Ident, Span};
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, parse_macro_input};

/// Derive macro for implementing `NativeState`.
///
/// Works on structs (named, tuple, unit) and enums. Unions are rejected.
#[proc_macro_derive(NativeState, attributes(native))]
pub fn derive_native_state(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let crate_path = match crate_path(&input) {
        Ok(path) => path,
        Err(err) => return err.to_compile_error().into(),
    };

    let body = match &input.data {
        Data::Struct(data) => struct_body(&data.fields, &crate_path),
        Data::Enum(data) => {
            let arms = data.variants.iter().map(|variant| {
                let ident = &variant.ident;
                let (pattern, sum) = variant_arm(&variant.fields, &crate_path);
                quote! { Self::#ident #pattern => #sum, }
            });

            if data.variants.is_empty() {
                quote! { match *self {} }
            } else {
                quote! {
                    match self {
                        #(#arms)*
                    }
                }
            }
        }
        Data::Union(_) => {
            return syn::Error::new_spanned(&input, "NativeState cannot be derived for unions")
                .to_compile_error()
                .into();
        }
    };

    let expanded = quote! {
        impl #impl_generics #crate_path::NativeState for #name #ty_generics #where_clause {
            fn external_memory_size(&self) -> usize {
                #body
            }
        }
    };

    TokenStream::from(expanded)
}

fn crate_path(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let mut crate_path = None;

    for attr in &input.attrs {
        if !attr.path().is_ident("native") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate_path") {
                let value: syn::LitStr = meta.value()?.parse()?;
                let path: syn::Path = value.parse()?;
                crate_path = Some(quote! { #path });
                Ok(())
            } else {
                Err(meta.error("expected `crate_path = \"...\"`"))
            }
        })?;
    }

    Ok(crate_path.unwrap_or_else(|| quote! { ::openworkers_host_env }))
}

fn size_of_expr(
    crate_path: &proc_macro2::TokenStream,
    place: proc_macro2::TokenStream,
) -> proc_macro2::TokenStream {
    quote! { #crate_path::NativeState::external_memory_size(#place) }
}

fn sum(terms: Vec<proc_macro2::TokenStream>) -> proc_macro2::TokenStream {
    if terms.is_empty() {
        quote! { 0 }
    } else {
        quote! { 0 #(+ #terms)* }
    }
}

fn struct_body(fields: &Fields, crate_path: &proc_macro2::TokenStream) -> proc_macro2::TokenStream {
    let terms = match fields {
        Fields::Named(named) => named
            .named
            .iter()
            .filter(|f| is_tracked(f))
            .map(|f| {
                let name = &f.ident;
                size_of_expr(crate_path, quote! { &self.#name })
            })
            .collect(),
        Fields::Unnamed(unnamed) => unnamed
            .unnamed
            .iter()
            .enumerate()
            .filter(|(_, f)| is_tracked(f))
            .map(|(i, _)| {
                let index = syn::Index::from(i);
                size_of_expr(crate_path, quote! { &self.#index })
            })
            .collect(),
        Fields::Unit => vec![],
    };

    sum(terms)
}

/// Builds the match pattern for one enum variant and the sum over its
/// tracked bindings.
fn variant_arm(
    fields: &Fields,
    crate_path: &proc_macro2::TokenStream,
) -> (proc_macro2::TokenStream, proc_macro2::TokenStream) {
    match fields {
        Fields::Named(named) => {
            let tracked: Vec<&Ident> = named
                .named
                .iter()
                .filter(|f| is_tracked(f))
                .filter_map(|f| f.ident.as_ref())
                .collect();
            let terms = tracked
                .iter()
                .map(|ident| size_of_expr(crate_path, quote! { #ident }))
                .collect();

            (quote! { { #(#tracked,)* .. } }, sum(terms))
        }
        Fields::Unnamed(unnamed) => {
            let mut bindings = Vec::new();
            let mut terms = Vec::new();

            for (i, field) in unnamed.unnamed.iter().enumerate() {
                if is_tracked(field) {
                    let binding = format_ident!("__field{}", i, span = Span::call_site());
                    terms.push(size_of_expr(crate_path, quote! { #binding }));
                    bindings.push(quote! { #binding });
                } else {
                    bindings.push(quote! { _ });
                }
            }

            (quote! { ( #(#bindings),* ) }, sum(terms))
        }
        Fields::Unit => (quote! {}, quote! { 0 }),
    }
}

fn is_tracked(field: &syn::Field) -> bool {
    field.attrs.iter().any(|attr| {
        if !attr.path().is_ident("native") {
            return false;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("track") {
                Ok(())
            } else {
                Err(meta.error("expected `track`"))
            }
        })
        .is_ok()
    })
}
