//! `#[tokio_timeout_test]`: runs an async test on a fresh current-thread
//! runtime in its own thread and fails it once a wall-clock budget is spent.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test(20)]
//! async fn streams() { /* ... */ }
//!
//! #[test_timeout::tokio_timeout_test(20, paused)]
//! async fn backoff() { /* tokio clock starts paused */ }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_SECS: u64 = 60;

enum Arg {
    Secs(LitInt),
    Flag(Ident),
}

impl Parse for Arg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            input.parse().map(Arg::Secs)
        } else {
            input.parse().map(Arg::Flag)
        }
    }
}

struct TestArgs {
    secs: u64,
    paused: bool,
}

impl Parse for TestArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TestArgs {
            secs: DEFAULT_SECS,
            paused: false,
        };
        for arg in Punctuated::<Arg, Token![,]>::parse_terminated(input)? {
            match arg {
                Arg::Secs(lit) => {
                    let secs: u64 = lit.base10_parse()?;
                    if secs == 0 {
                        return Err(syn::Error::new_spanned(
                            lit,
                            "timeout must be greater than zero",
                        ));
                    }
                    args.secs = secs;
                }
                Arg::Flag(flag) if flag == "paused" => args.paused = true,
                Arg::Flag(flag) => {
                    return Err(syn::Error::new_spanned(
                        &flag,
                        format!("unknown option `{flag}`, expected `paused`"),
                    ))
                }
            }
        }
        Ok(args)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TestArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();
    let secs = args.secs;
    let runtime = runtime_builder(args.paused);
    // a paused clock auto-advances, so only the wall-clock budget applies
    let body = if args.paused {
        quote! { async move #block .await; }
    } else {
        quote! {
            tokio::time::timeout(budget, async move #block)
                .await
                .expect("test timed out");
        }
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let budget = std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #runtime;
                    runtime.block_on(async { #body });
                }));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(budget) {
                Ok(Ok(())) => {}
                Ok(Err(panic)) => std::panic::resume_unwind(panic),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    })
}

fn runtime_builder(paused: bool) -> TokenStream2 {
    let pause = if paused {
        quote! { .start_paused(true) }
    } else {
        quote! {}
    };
    quote! {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            #pause
            .build()
            .expect("failed to build Tokio runtime")
    }
}

// `#[test]` and `#[tokio::test]` would double-register the function.
fn is_test_attribute(attr: &Attribute) -> bool {
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
