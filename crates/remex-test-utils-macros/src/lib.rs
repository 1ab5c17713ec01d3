// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Attribute macros for remex tests.
//!
//! Both macros wrap the test body with a [`remex_test_utils::TestLoggerGuard`]:
//! the test gets a unique log file, a `logger` binding for explicit notes, and
//! every `tracing` event emitted on the test thread lands in the same file.

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::quote;
use syn::{parse_macro_input, spanned::Spanned, ItemFn, ReturnType, Type};

/// Wraps a synchronous `#[test]`.
///
/// ```rust,ignore
/// #[remex_test_utils::logged_test]
/// fn encodes_root() {
///     logger.log("encoding").unwrap();
/// }
/// ```
#[proc_macro_attribute]
pub fn logged_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        return syn::Error::new(Span::call_site(), "#[logged_test] takes no arguments")
            .to_compile_error()
            .into();
    }

    let input = parse_macro_input!(item as ItemFn);
    if let Some(async_token) = &input.sig.asyncness {
        return syn::Error::new(
            async_token.span(),
            "#[logged_test] is for synchronous tests; use #[logged_tokio_test]",
        )
        .to_compile_error()
        .into();
    }

    expand(input, quote! { #[::core::prelude::v1::test] })
}

/// Wraps an async test in `#[tokio::test]`, forwarding any arguments
/// (`flavor = "multi_thread"`, `start_paused = true`, ...).
#[proc_macro_attribute]
pub fn logged_tokio_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = TokenStream2::from(attr);
    let input = parse_macro_input!(item as ItemFn);

    if input.sig.asyncness.is_none() {
        return syn::Error::new(
            input.sig.ident.span(),
            "#[logged_tokio_test] requires an async fn",
        )
        .to_compile_error()
        .into();
    }

    let harness = if args.is_empty() {
        quote! { #[::tokio::test] }
    } else {
        quote! { #[::tokio::test( #args )] }
    };
    expand(input, harness)
}

fn expand(mut input: ItemFn, harness: TokenStream2) -> TokenStream {
    input.attrs.retain(|attr| !is_logged_attr(attr));

    let ident = &input.sig.ident;
    if !input.sig.inputs.is_empty() {
        return syn::Error::new(ident.span(), "logged tests cannot take parameters")
            .to_compile_error()
            .into();
    }

    let name = ident.to_string();
    let vis = &input.vis;
    let asyncness = &input.sig.asyncness;
    let generics = &input.sig.generics;
    let attrs = &input.attrs;
    let block = &input.block;
    let (kind, ret) = classify_return(&input.sig.output);
    let finish = finish_tokens(kind);

    quote! {
        #harness
        #(#attrs)*
        #vis #asyncness fn #ident #generics () #ret {
            let mut __guard = ::remex_test_utils::TestLoggerGuard::new(#name)
                .expect("failed to create test log");
            let __tracing = __guard.capture_tracing();
            let mut logger = __guard.logger();
            let _ = &mut logger;

            let inner_result = { #block };
            drop(logger);
            drop(__tracing);
            #finish
        }
    }
    .into()
}

#[derive(Clone, Copy)]
enum ReturnKind {
    Unit,
    Result,
    Other,
}

fn classify_return(output: &ReturnType) -> (ReturnKind, TokenStream2) {
    match output {
        ReturnType::Default => (ReturnKind::Unit, quote! {}),
        ReturnType::Type(arrow, ty) if is_result(ty) => (ReturnKind::Result, quote! { #arrow #ty }),
        ReturnType::Type(arrow, ty) => (ReturnKind::Other, quote! { #arrow #ty }),
    }
}

fn is_result(ty: &Type) -> bool {
    match ty {
        Type::Path(path) => path.path.segments.last().is_some_and(|s| s.ident == "Result"),
        _ => false,
    }
}

fn finish_tokens(kind: ReturnKind) -> TokenStream2 {
    match kind {
        ReturnKind::Unit => quote! {
            let _ = inner_result;
            if let Err(e) = __guard.finish_success() {
                panic!("failed to finalize test log: {}", e);
            }
        },
        ReturnKind::Result => quote! {
            match inner_result {
                ::std::result::Result::Ok(value) => {
                    if let Err(e) = __guard.finish_success() {
                        panic!("failed to finalize test log: {}", e);
                    }
                    ::std::result::Result::Ok(value)
                }
                ::std::result::Result::Err(err) => {
                    let message = format!("{}", err);
                    if let Err(e) = __guard.finish_failure(&message) {
                        eprintln!("failed to finalize test log after error: {}", e);
                    }
                    ::std::result::Result::Err(err)
                }
            }
        },
        ReturnKind::Other => quote! {
            let value = inner_result;
            if let Err(e) = __guard.finish_success() {
                panic!("failed to finalize test log: {}", e);
            }
            value
        },
    }
}

fn is_logged_attr(attr: &syn::Attribute) -> bool {
    attr.path()
        .segments
        .last()
        .is_some_and(|s| s.ident == "logged_test" || s.ident == "logged_tokio_test")
}
