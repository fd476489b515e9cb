//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[test_timeout::timeout]` wraps a synchronous test,
//! `#[test_timeout::tokio_timeout_test]` wraps an async one in a
//! current-thread Tokio runtime. Both take an optional limit in seconds
//! (`#[test_timeout::timeout(5)]`); the default is 60.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let limit = match timeout_secs(attr) {
        Ok(limit) => limit,
        Err(err) => return err.to_compile_error().into(),
    };
    let function = parse_macro_input!(item as ItemFn);

    if function.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "use #[test_timeout::tokio_timeout_test] for async tests",
        )
        .to_compile_error()
        .into();
    }

    let block = &function.block;
    let body = quote! { #block };
    watchdog_test(function.attrs, function.vis, function.sig, limit, body).into()
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let limit = match timeout_secs(attr) {
        Ok(limit) => limit,
        Err(err) => return err.to_compile_error().into(),
    };
    let mut function = parse_macro_input!(item as ItemFn);

    if function.sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "tokio_timeout_test expects an async fn",
        )
        .to_compile_error()
        .into();
    }
    function.sig.asyncness = None;

    let block = &function.block;
    let body = quote! {
        {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(__limit, async move #block)
                    .await
                    .expect("test timed out");
            });
        }
    };
    watchdog_test(function.attrs, function.vis, function.sig, limit, body).into()
}

fn timeout_secs(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let literal: LitInt = syn::parse(attr)?;
    let secs: u64 = literal.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(literal, "timeout must be at least one second"));
    }
    Ok(secs)
}

/// Emit a `#[test]` that runs `body` on a worker thread and fails if it has
/// not finished within `limit` seconds. Panics from the body are re-raised
/// on the test thread so `#[should_panic]` keeps working.
fn watchdog_test(
    attrs: Vec<Attribute>,
    vis: syn::Visibility,
    sig: syn::Signature,
    limit: u64,
    body: TokenStream2,
) -> TokenStream2 {
    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let __limit = std::time::Duration::from_secs(#limit);
            let (__done, __outcome) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #body));
                let _ = __done.send(result);
            });
            match __outcome.recv_timeout(__limit) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s", #limit)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    }
}

/// `#[test]` and `#[tokio::test]` are supplied by the wrapper
fn is_test_marker(attr: &Attribute) -> bool {
    let path = attr.path();
    if path.is_ident("test") {
        return true;
    }
    let mut segments = path.segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
