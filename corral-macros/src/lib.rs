#![allow(clippy::needless_doctest_main)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Entry-point attributes for corral, modelled on tokio-macros.

mod entry;
mod parse;

/// Runs an async `main` as the root task of a freshly built task processor.
///
/// The processor is shut down, cancelling and awaiting every remaining task,
/// once `main` returns.
///
/// # Options
///
/// - `worker_threads = N` sizes the worker pool. Defaults to the number of
///   CPUs.
/// - `name = "..."` names the processor and, by default, its threads.
///
/// Function arguments are NOT allowed.
///
/// # Usage
///
/// ```no_run
/// #[corral::main(worker_threads = 4)]
/// async fn main() {
///     let task = corral::spawn(async { 21 * 2 });
///     assert_eq!(task.get().await.unwrap(), 42);
/// }
/// ```
///
/// Equivalent code not using `#[corral::main]`
///
/// ```no_run
/// fn main() {
///     corral::runtime::Builder::new()
///         .worker_threads(4)
///         .try_build()
///         .unwrap()
///         .block_on(async {
///             let task = corral::spawn(async { 21 * 2 });
///             assert_eq!(task.get().await.unwrap(), 42);
///         })
/// }
/// ```
#[proc_macro_attribute]
pub fn main(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::main(args.into(), item.into()).into()
}

/// Like [`main`](macro@main) for `#[test]` functions. Each test gets its own
/// task processor with a single worker unless `worker_threads` says otherwise.
///
/// ```no_run
/// #[corral::test(worker_threads = 2)]
/// async fn my_test() {
///     corral::time::yield_now().await;
/// }
/// ```
///
/// Equivalent code not using `#[corral::test]`
///
/// ```no_run
/// #[test]
/// fn my_test() {
///     corral::runtime::Builder::new()
///         .worker_threads(2)
///         .try_build()
///         .unwrap()
///         .block_on(async {
///             corral::time::yield_now().await;
///         })
/// }
/// ```
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}
