use proc_macro2::TokenStream;
use quote::{quote, quote_spanned};
use syn::ItemFn;

use crate::parse::{EntryArgs, is_test_attribute, last_stmt_span, token_stream_with_error};

/// Tests get one worker unless asked otherwise, the root task runs on the
/// test thread itself.
const TEST_WORKER_THREADS: usize = 1;

/// For example:
///
/// ```rust,no_run
/// #[corral::main(worker_threads = 2, name = "api")]
/// async fn main() {
///     println!("Hello world");
/// }
/// ```
///
/// `args` holds `worker_threads = 2, name = "api"` and `item` the async
/// function that becomes the root task.
pub(crate) fn main(args: TokenStream, item: TokenStream) -> TokenStream {
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let args = check_async(&input).and_then(|()| {
        if input.sig.ident == "main" && !input.sig.inputs.is_empty() {
            let msg = "the main function cannot accept arguments";
            return Err(syn::Error::new_spanned(&input.sig.ident, msg));
        }
        syn::parse2::<EntryArgs>(args)
    });
    finish(input, false, args)
}

pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let args = check_async(&input).and_then(|()| {
        if let Some(attr) = input.attrs.iter().find(|attr| is_test_attribute(attr)) {
            let msg = "second test attribute is supplied, consider removing or changing the order of your test attributes";
            return Err(syn::Error::new_spanned(attr, msg));
        }
        syn::parse2::<EntryArgs>(args)
    });
    finish(input, true, args)
}

fn check_async(input: &ItemFn) -> syn::Result<()> {
    match input.sig.asyncness {
        Some(_) => Ok(()),
        None => {
            let msg = "the `async` keyword is missing from the function declaration";
            Err(syn::Error::new_spanned(input.sig.fn_token, msg))
        }
    }
}

/// On invalid arguments the function is still expanded with the defaults, so
/// that IDE completions inside the body keep working.
fn finish(input: ItemFn, is_test: bool, args: syn::Result<EntryArgs>) -> TokenStream {
    match args {
        Ok(args) => expand(input, is_test, args),
        Err(e) => token_stream_with_error(expand(input, is_test, EntryArgs::default()), e),
    }
}

fn expand(mut input: ItemFn, is_test: bool, args: EntryArgs) -> TokenStream {
    input.sig.asyncness = None;
    let (last_stmt_start_span, last_stmt_end_span) = last_stmt_span(&input.block);

    let mut processor = quote_spanned! {last_stmt_start_span=>
        corral::runtime::Builder::new()
    };
    let worker_threads = args
        .worker_threads
        .or_else(|| is_test.then_some(TEST_WORKER_THREADS));
    if let Some(v) = worker_threads {
        processor = quote_spanned! {last_stmt_start_span=> #processor.worker_threads(#v) };
    }
    if let Some(name) = args.name {
        processor = quote_spanned! {last_stmt_start_span=> #processor.name(#name) };
    }

    // The processor is dropped, and thus shut down, before returning.
    let last_block = quote_spanned! {last_stmt_end_span=>
        #[allow(clippy::expect_used, clippy::diverging_sub_expression, clippy::needless_return, clippy::unwrap_in_result)]
        {
            return #processor
                .try_build()
                .expect("Failed building the TaskProcessor")
                .block_on(body);
        }
    };

    // Tests block on a `Pin<&mut dyn Future>` so that `block_on` is
    // instantiated once for all of them.
    let block = &input.block;
    let body = if is_test {
        let output_type = match &input.sig.output {
            syn::ReturnType::Default => quote! { () },
            syn::ReturnType::Type(_, ret_type) => quote! { #ret_type },
        };
        quote! {
            let unpinned = async #block;
            let pinned = std::pin::pin!(unpinned);
            let body: ::core::pin::Pin<&mut dyn ::core::future::Future<Output = #output_type>> = pinned;
        }
    } else {
        quote! {
            let body = async #block;
        }
    };

    // Inner attributes of the body cannot stay inside the rewritten block.
    let attrs = input.attrs.iter().map(|attr| {
        let mut attr = attr.clone();
        attr.style = syn::AttrStyle::Outer;
        attr
    });
    let test_attr = is_test.then(|| quote! { #[::core::prelude::v1::test] });
    let (vis, sig) = (&input.vis, &input.sig);

    quote! {
        #(#attrs)*
        #test_attr
        #vis #sig {
            #body
            #last_block
        }
    }
}
