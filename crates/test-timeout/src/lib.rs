//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[test_timeout::timeout]` wraps a synchronous test, and
//! `#[test_timeout::tokio_timeout_test]` wraps an async one in a fresh
//! current-thread runtime. Both accept an optional limit in seconds
//! (`#[test_timeout::timeout(5)]`); `CALLBOX_TEST_TIMEOUT_SECS` overrides the
//! limit at run time, which helps on slow CI machines.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt, ReturnType};

const DEFAULT_LIMIT_SECS: u64 = 30;
const OVERRIDE_ENV: &str = "CALLBOX_TEST_TIMEOUT_SECS";

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let function = parse_macro_input!(item as ItemFn);
    expand(attr, function, Flavor::Sync)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let function = parse_macro_input!(item as ItemFn);
    expand(attr, function, Flavor::Tokio)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[derive(Clone, Copy)]
enum Flavor {
    Sync,
    Tokio,
}

fn expand(attr: TokenStream, function: ItemFn, flavor: Flavor) -> syn::Result<TokenStream2> {
    let limit = parse_limit(attr)?;
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = function;

    if !matches!(sig.output, ReturnType::Default) {
        return Err(syn::Error::new_spanned(
            &sig.output,
            "timeout-wrapped tests must not return a value; assert or panic instead",
        ));
    }

    let body = match flavor {
        Flavor::Sync => {
            if sig.asyncness.is_some() {
                return Err(syn::Error::new_spanned(
                    sig.fn_token,
                    "use `tokio_timeout_test` for async tests",
                ));
            }
            quote! { move || #block }
        }
        Flavor::Tokio => {
            if sig.asyncness.take().is_none() {
                return Err(syn::Error::new_spanned(
                    sig.fn_token,
                    "`tokio_timeout_test` expects an async fn",
                ));
            }
            quote! {
                move || {
                    let runtime = ::tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("build test runtime");
                    runtime.block_on(async move {
                        if ::tokio::time::timeout(__limit, async move #block).await.is_err() {
                            panic!("async test exceeded {:?}", __limit);
                        }
                    });
                }
            }
        }
    };

    let thread_name = sig.ident.to_string();
    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let __limit = ::std::env::var(#OVERRIDE_ENV)
                .ok()
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(::std::time::Duration::from_secs)
                .unwrap_or(::std::time::Duration::from_secs(#limit));
            let (__done, __outcome) = ::std::sync::mpsc::channel();
            let __body = #body;
            ::std::thread::Builder::new()
                .name(::std::string::String::from(#thread_name))
                .spawn(move || {
                    let result = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(__body));
                    let _ = __done.send(result);
                })
                .expect("spawn test thread");
            match __outcome.recv_timeout(__limit) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {:?}", __limit)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    })
}

fn parse_limit(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_LIMIT_SECS);
    }
    let literal: LitInt = syn::parse(attr)?;
    let secs: u64 = literal.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(literal, "timeout must be at least one second"));
    }
    Ok(secs)
}

/// Drops `#[test]` and `#[tokio::test]` so the test is not registered twice.
fn is_test_marker(attr: &Attribute) -> bool {
    let path = attr.path();
    path.is_ident("test")
        || (path.segments.len() == 2
            && path.segments[0].ident == "tokio"
            && path.segments[1].ident == "test")
}
