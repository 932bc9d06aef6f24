use proc_macro2::{Span, TokenStream};
use quote::ToTokens;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ExprLit, Lit, Meta, Token};

const KNOWN_ARGS: &str = "`worker_threads`, `name`";

/// Arguments of `#[corral::main(..)]` and `#[corral::test(..)]`.
#[derive(Debug, Default)]
pub(crate) struct EntryArgs {
    pub(crate) worker_threads: Option<usize>,
    pub(crate) name: Option<String>,
}

impl Parse for EntryArgs {
    fn parse(input: ParseStream<'_>) -> syn::Result<Self> {
        let mut args = EntryArgs::default();
        for meta in Punctuated::<Meta, Token![,]>::parse_terminated(input)? {
            args.apply(meta)?;
        }
        Ok(args)
    }
}

impl EntryArgs {
    fn apply(&mut self, meta: Meta) -> syn::Result<()> {
        let pair = match meta {
            Meta::NameValue(pair) => pair,
            Meta::Path(path) => return Err(bare_key_error(&path)),
            Meta::List(list) => {
                let msg = format!("expected `key = value` with a key among {KNOWN_ARGS}");
                return Err(syn::Error::new_spanned(list, msg));
            }
        };

        let Some(key) = pair.path.get_ident().map(ToString::to_string) else {
            return Err(syn::Error::new_spanned(&pair.path, "expected a plain identifier"));
        };
        let Expr::Lit(ExprLit { lit, .. }) = &pair.value else {
            let msg = format!("`{key}` takes a literal value");
            return Err(syn::Error::new_spanned(&pair.value, msg));
        };

        match key.as_str() {
            "worker_threads" => {
                let Lit::Int(int) = lit else {
                    return Err(syn::Error::new_spanned(lit, "`worker_threads` takes an integer"));
                };
                let n = int.base10_parse::<usize>()?;
                if n == 0 {
                    return Err(syn::Error::new_spanned(lit, "`worker_threads` may not be 0"));
                }
                set_once(&mut self.worker_threads, n, lit, &key)
            }
            "name" => {
                let Lit::Str(s) = lit else {
                    return Err(syn::Error::new_spanned(lit, "`name` takes a string"));
                };
                let name = s.value();
                if name.is_empty() {
                    return Err(syn::Error::new_spanned(lit, "`name` may not be empty"));
                }
                set_once(&mut self.name, name, lit, &key)
            }
            _ => Err(syn::Error::new_spanned(&pair.path, unknown_key(&key))),
        }
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, lit: &Lit, key: &str) -> syn::Result<()> {
    match slot.replace(value) {
        Some(_) => Err(syn::Error::new_spanned(lit, format!("`{key}` set more than once"))),
        None => Ok(()),
    }
}

fn bare_key_error(path: &syn::Path) -> syn::Error {
    let key = path.to_token_stream().to_string();
    let msg = match key.as_str() {
        "worker_threads" | "name" => format!("`{key}` requires a value, as in `{key} = ..`"),
        "flavor" | "multi_thread" | "current_thread" => format!(
            "there is a single kind of task processor, size it with `worker_threads` instead of `{key}`"
        ),
        _ => unknown_key(&key),
    };
    syn::Error::new_spanned(path, msg)
}

fn unknown_key(key: &str) -> String {
    format!("unknown argument `{key}`, expected one of {KNOWN_ARGS}")
}

/// Whether `attr` is `#[test]`, spelled plainly or through a prelude path.
pub(crate) fn is_test_attribute(attr: &Attribute) -> bool {
    let Meta::Path(path) = &attr.meta else {
        return false;
    };
    if path.segments.iter().any(|seg| !seg.arguments.is_none()) {
        return false;
    }

    let segments: Vec<String> = path.segments.iter().map(|seg| seg.ident.to_string()).collect();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
    match segments.as_slice() {
        ["test"] => path.leading_colon.is_none(),
        ["core" | "std", "prelude", _, "test"] => true,
        _ => false,
    }
}

/// First and last token spans of the final statement of `block`, so type
/// errors of the generated tail point at the user's last expression.
pub(crate) fn last_stmt_span(block: &syn::Block) -> (Span, Span) {
    let tokens = block
        .stmts
        .last()
        .map(ToTokens::to_token_stream)
        .unwrap_or_default();

    let mut tokens = tokens.into_iter();
    let start = tokens.next().map_or_else(Span::call_site, |t| t.span());
    let end = tokens.last().map_or(start, |t| t.span());
    (start, end)
}

pub(crate) fn token_stream_with_error(mut tokens: TokenStream, error: syn::Error) -> TokenStream {
    tokens.extend(error.into_compile_error());
    tokens
}
