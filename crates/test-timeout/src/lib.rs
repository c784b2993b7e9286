use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt, ReturnType};

/// Runs an async test on a current-thread runtime whose clock starts paused.
///
/// Sleeps and intervals auto-advance, so retry delays and reconciliation
/// periods cost no wall time. The argument is a wall-clock budget in seconds
/// (default 30); a test that stalls past it fails instead of hanging.
#[proc_macro_attribute]
pub fn tokio_paused_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut wall_secs: u64 = 30;

    if !attr.is_empty() {
        let lit = parse_macro_input!(attr as LitInt);
        wall_secs = lit
            .base10_parse()
            .unwrap_or_else(|err| panic!("invalid wall-clock budget: {err}"));
        if wall_secs == 0 {
            panic!("wall-clock budget must be greater than zero");
        }
    }

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_paused_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    sig.asyncness = None;
    // A fallible body is checked inside the runtime thread; the generated
    // test itself returns unit.
    let output = std::mem::replace(&mut sig.output, ReturnType::Default);
    let check_outcome = match &output {
        ReturnType::Default => quote! { let () = outcome; },
        ReturnType::Type(..) => quote! {
            if let Err(err) = outcome {
                panic!("test returned an error: {err:?}");
            }
        },
    };

    let kept_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    TokenStream::from(quote! {
        #[test]
        #(#kept_attrs)*
        #vis #sig {
            let wall_budget = std::time::Duration::from_secs(#wall_secs);
            // A day of virtual time is far beyond any schedule under test.
            let virtual_budget = std::time::Duration::from_secs(86_400);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .start_paused(true)
                        .build()
                        .expect("failed to build paused Tokio runtime");
                    async fn test_body() #output #block
                    runtime.block_on(async {
                        let outcome = tokio::time::timeout(virtual_budget, test_body())
                            .await
                            .expect("test exceeded its virtual time budget");
                        #check_outcome
                    });
                }));
                let _ = sender.send(outcome);
            });
            match receiver.recv_timeout(wall_budget) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded its wall-clock budget")
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
