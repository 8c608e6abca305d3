//! `#[test_timeout::timeout_test(secs)]` turns a sync or async function into a
//! `#[test]` that fails once `secs` seconds have elapsed.
//!
//! Async bodies run on a dedicated two-worker tokio runtime. Every test gets a
//! `tracing` subscriber that writes through the libtest capture, filtered by
//! `RUST_LOG`, so the calling crate must depend on `tokio` and
//! `tracing-subscriber` (with `env-filter`).

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[proc_macro_attribute]
pub fn timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = if attr.is_empty() {
        DEFAULT_TIMEOUT_SECS
    } else {
        let lit = parse_macro_input!(attr as LitInt);
        match lit.base10_parse::<u64>() {
            Ok(0) => {
                return syn::Error::new_spanned(lit, "timeout must be greater than zero")
                    .to_compile_error()
                    .into()
            }
            Ok(secs) => secs,
            Err(err) => return err.to_compile_error().into(),
        }
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    let body: TokenStream2 = if sig.asyncness.take().is_some() {
        quote! {
            let runtime = ::tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .expect("failed to build tokio runtime");
            runtime.block_on(async move #block);
        }
    } else {
        quote! { #block }
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let _ = ::tracing_subscriber::fmt()
                .with_env_filter(::tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();

            let deadline = ::std::time::Duration::from_secs(#timeout_secs);
            let (done_tx, done_rx) = ::std::sync::mpsc::channel();
            ::std::thread::spawn(move || {
                let outcome = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(deadline) {
                Ok(Ok(())) => {}
                Ok(Err(panic)) => ::std::panic::resume_unwind(panic),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s deadline", #timeout_secs)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    })
}

/// Drops `#[test]` and `#[tokio::test]` so the expansion does not register the
/// function twice.
fn is_test_marker(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
