//! Test attributes that fail a test which runs past a wall-clock bound.
//!
//! The bound is given as bare seconds (`#[timeout(5)]`), or as `secs = N` or
//! `ms = N`. Without arguments a test gets 60 seconds. The body runs on its
//! own thread so a test stuck outside the async runtime is caught as well.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_MILLIS: u64 = 60_000;

struct Bound {
    millis: u64,
}

impl Parse for Bound {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.is_empty() {
            return Ok(Bound {
                millis: DEFAULT_MILLIS,
            });
        }
        let (unit, lit) = if input.peek(LitInt) {
            (None, input.parse::<LitInt>()?)
        } else {
            let unit: Ident = input.parse()?;
            input.parse::<Token![=]>()?;
            (Some(unit), input.parse::<LitInt>()?)
        };
        if !input.is_empty() {
            return Err(input.error("expected a single timeout value"));
        }

        let value: u64 = lit.base10_parse()?;
        let millis = match unit.as_ref().map(|unit| unit.to_string()).as_deref() {
            None | Some("secs") => value.checked_mul(1000),
            Some("ms") => Some(value),
            Some(_) => {
                return Err(syn::Error::new_spanned(unit, "expected `secs` or `ms`"));
            }
        };
        match millis {
            Some(millis) if millis > 0 => Ok(Bound { millis }),
            _ => Err(syn::Error::new_spanned(lit, "timeout must be greater than zero")),
        }
    }
}

/// Runs an `async fn` test on a current-thread Tokio runtime under the bound.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let bound = parse_macro_input!(attr as Bound);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(&sig.ident, "tokio_timeout_test needs an async fn")
            .to_compile_error()
            .into();
    }
    sig.asyncness = None;

    let millis = bound.millis;
    let body = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(
                std::time::Duration::from_millis(#millis),
                async move #block,
            )
            .await
            .expect("test timed out")
        })
    };
    expand(strip(attrs, is_tokio_test), vis, sig, body, millis)
}

/// Runs a synchronous test under the bound.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let bound = parse_macro_input!(attr as Bound);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout expects a synchronous fn; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let body = quote! { #block };
    expand(strip(attrs, is_plain_test), vis, sig, body, bound.millis)
}

fn expand(
    attrs: Vec<Attribute>,
    vis: syn::Visibility,
    sig: syn::Signature,
    body: TokenStream2,
    millis: u64,
) -> TokenStream {
    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = std::time::Duration::from_millis(#millis);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(limit) {
                Ok(Ok(value)) => value,
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {:?}", limit)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    })
}

/// Drops attributes the generated `#[test]` replaces.
fn strip(attrs: Vec<Attribute>, replaced: fn(&Attribute) -> bool) -> Vec<Attribute> {
    attrs.into_iter().filter(|attr| !replaced(attr)).collect()
}

fn is_tokio_test(attr: &Attribute) -> bool {
    let path: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    path == ["tokio", "test"] || path == ["test"]
}

fn is_plain_test(attr: &Attribute) -> bool {
    attr.path().is_ident("test")
}
